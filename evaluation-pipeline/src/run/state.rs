use state_machines::state_machine;

state_machine! {
    name: EvaluationMachine,
    state: EvaluationState,
    initial: Ready,
    states: [Ready, Enumerated, Evaluated, Summarized],
    events {
        enumerate { transition: { from: Ready, to: Enumerated } }
        evaluate { transition: { from: Enumerated, to: Evaluated } }
        summarize { transition: { from: Evaluated, to: Summarized } }
    }
}

pub fn ready() -> EvaluationMachine<(), Ready> {
    EvaluationMachine::new(())
}
