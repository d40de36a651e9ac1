use std::{future::Future, time::Duration};

use async_trait::async_trait;
use common::utils::config::AppConfig;
use reqwest::{
    header::ACCEPT,
    multipart::{Form, Part},
    RequestBuilder,
};
use serde_json::Value;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    poll::{JobStatus, PollPolicy, STALLED_STATUS},
    ExtractionError, ExtractionRequest, ExtractionService,
};

const JOB_ID_KEYS: [&str; 5] = ["guid", "id", "job_id", "task_id", "JobId"];
const DOCUMENT_MIME: &str = "application/pdf";

/// HTTP client for the upload -> status -> retrieve job protocol.
#[derive(Debug, Clone)]
pub struct HttpExtractionClient {
    http: reqwest::Client,
    api_prefix: String,
    datacontext: String,
    poll: PollPolicy,
}

impl HttpExtractionClient {
    pub fn new(
        api_prefix: &str,
        datacontext: impl Into<String>,
        poll: PollPolicy,
    ) -> Result<Self, ExtractionError> {
        let http = reqwest::Client::builder().build()?;
        let trimmed = api_prefix.trim().trim_matches('/');
        let api_prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        };

        Ok(Self {
            http,
            api_prefix,
            datacontext: datacontext.into(),
            poll,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ExtractionError> {
        Self::new(
            &config.extraction_api_prefix,
            config.extraction_datacontext.clone(),
            PollPolicy::new(
                Duration::from_millis(config.poll_interval_ms),
                Duration::from_secs(config.extraction_timeout_secs),
            ),
        )
    }

    fn api_base(&self, endpoint: &str) -> Result<String, ExtractionError> {
        let parsed = Url::parse(endpoint.trim())
            .map_err(|err| ExtractionError::InvalidEndpoint(format!("{endpoint}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ExtractionError::InvalidEndpoint(format!(
                "{endpoint}: unsupported scheme {}",
                parsed.scheme()
            )));
        }
        Ok(format!(
            "{}{}",
            endpoint.trim().trim_end_matches('/'),
            self.api_prefix
        ))
    }

    fn authorized(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        let builder = builder.header(ACCEPT, "application/json");
        match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn submit(
        &self,
        api_base: &str,
        request: &ExtractionRequest,
    ) -> Result<String, ExtractionError> {
        let part = Part::bytes(request.document.to_vec())
            .file_name(request.filename.clone())
            .mime_str(DOCUMENT_MIME)?;
        let form = Form::new().part("file", part);

        let mut query: Vec<(&str, &str)> = request
            .extraction_types
            .iter()
            .map(|name| ("extraction_types", name.as_str()))
            .collect();
        query.push(("datacontext", self.datacontext.as_str()));

        let response = Self::authorized(
            self.http.post(format!("{api_base}/upload/")),
            request.auth_token.as_deref(),
        )
        .query(&query)
        .multipart(form)
        .send()
        .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Upload {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await?;
        job_id_from_upload(&body).ok_or_else(|| ExtractionError::MissingJobId(body.to_string()))
    }

    async fn poll_status(
        &self,
        status_url: &str,
        token: Option<&str>,
    ) -> Result<JobStatus, ExtractionError> {
        let response = Self::authorized(self.http.get(status_url), token)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::TransientPollFailure(format!(
                "HTTP {}: {body}",
                status.as_u16()
            )));
        }

        let body: Value = response.json().await?;
        let raw = match body.get("status") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        match JobStatus::classify(&raw) {
            JobStatus::Pending(label) if label.is_empty() => Ok(JobStatus::Pending(body.to_string())),
            JobStatus::Failed(_) => Ok(JobStatus::Failed(body.to_string())),
            classified => Ok(classified),
        }
    }

    async fn retrieve(
        &self,
        retrieve_url: &str,
        token: Option<&str>,
    ) -> Result<Value, ExtractionError> {
        let response = Self::authorized(self.http.get(retrieve_url), token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Retrieve {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    fn stalled(&self, filename: &str) -> ExtractionError {
        warn!(timeout_secs = self.poll.timeout.as_secs(), "extraction request outlived the deadline");
        ExtractionError::ExtractionTimeout {
            filename: filename.to_string(),
            timeout_secs: self.poll.timeout.as_secs(),
            last_status: STALLED_STATUS.to_string(),
        }
    }

    async fn within<T, F>(&self, deadline: Instant, filename: &str, call: F) -> Result<T, ExtractionError>
    where
        F: Future<Output = Result<T, ExtractionError>>,
    {
        timeout_at(deadline, call)
            .await
            .unwrap_or_else(|_| Err(self.stalled(filename)))
    }
}

#[async_trait]
impl ExtractionService for HttpExtractionClient {
    /// Upload, polling and retrieval all run against one deadline.
    #[tracing::instrument(skip_all, fields(filename = %request.filename))]
    async fn extract(&self, request: ExtractionRequest) -> Result<Value, ExtractionError> {
        let deadline = self.poll.deadline();
        let api_base = self.api_base(&request.endpoint)?;
        let job_id = self
            .within(deadline, &request.filename, self.submit(&api_base, &request))
            .await?;
        info!(job_id = %job_id, "extraction job submitted");

        let token = request.auth_token.as_deref();
        let status_url = format!("{api_base}/status/{job_id}");
        self.poll
            .wait_until(&request.filename, deadline, || {
                self.poll_status(&status_url, token)
            })
            .await?;

        let retrieve_url = format!("{api_base}/retrieve/{job_id}");
        let result = self
            .within(deadline, &request.filename, self.retrieve(&retrieve_url, token))
            .await?;
        debug!(job_id = %job_id, "extraction result retrieved");
        Ok(result)
    }
}

/// Job handle from an upload response: the first known key with a usable value,
/// then a case-insensitive match. Numeric handles are rendered as strings.
pub fn job_id_from_upload(body: &Value) -> Option<String> {
    let object = body.as_object()?;
    let usable = |value: &Value| match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    };

    JOB_ID_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(usable))
        .or_else(|| {
            object.iter().find_map(|(key, value)| {
                let lowered = key.to_lowercase();
                JOB_ID_KEYS
                    .iter()
                    .any(|known| known.to_lowercase() == lowered)
                    .then(|| usable(value))
                    .flatten()
            })
        })
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use axum::{
        extract::{Multipart, Path, RawQuery, State},
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use bytes::Bytes;
    use serde_json::json;
    use tokio::{net::TcpListener, sync::Mutex};

    use super::*;

    #[derive(Default)]
    struct Recorded {
        query: Option<String>,
        authorization: Option<String>,
        file_name: Option<String>,
        file_bytes: usize,
        status_job_ids: Vec<String>,
    }

    struct FakeApi {
        upload_status: StatusCode,
        status_delay: Duration,
        statuses: Vec<(StatusCode, Value)>,
        polls: AtomicUsize,
        retrieves: AtomicUsize,
        recorded: Mutex<Recorded>,
    }

    impl FakeApi {
        fn new(statuses: Vec<(StatusCode, Value)>) -> Self {
            Self {
                upload_status: StatusCode::ACCEPTED,
                status_delay: Duration::ZERO,
                statuses,
                polls: AtomicUsize::new(0),
                retrieves: AtomicUsize::new(0),
                recorded: Mutex::new(Recorded::default()),
            }
        }
    }

    async fn upload(
        State(api): State<Arc<FakeApi>>,
        RawQuery(query): RawQuery,
        headers: HeaderMap,
        mut multipart: Multipart,
    ) -> (StatusCode, Json<Value>) {
        let mut recorded = api.recorded.lock().await;
        recorded.query = query;
        recorded.authorization = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        while let Ok(Some(field)) = multipart.next_field().await {
            if field.name() == Some("file") {
                recorded.file_name = field.file_name().map(ToString::to_string);
                recorded.file_bytes = field.bytes().await.map(|b| b.len()).unwrap_or_default();
            }
        }
        (api.upload_status, Json(json!({"JobID": 4242})))
    }

    async fn status(
        State(api): State<Arc<FakeApi>>,
        Path(id): Path<String>,
    ) -> (StatusCode, Json<Value>) {
        api.recorded.lock().await.status_job_ids.push(id);
        if !api.status_delay.is_zero() {
            tokio::time::sleep(api.status_delay).await;
        }
        let call = api.polls.fetch_add(1, Ordering::SeqCst);
        let (code, body) = api
            .statuses
            .get(call)
            .or_else(|| api.statuses.last())
            .cloned()
            .unwrap_or((StatusCode::OK, json!({"status": "done"})));
        (code, Json(body))
    }

    async fn retrieve(State(api): State<Arc<FakeApi>>, Path(id): Path<String>) -> Json<Value> {
        api.retrieves.fetch_add(1, Ordering::SeqCst);
        Json(json!({
            "filename": "doc.pdf",
            "job": id,
            "extracted_data": {"patient_profile": {"name": "Jane"}}
        }))
    }

    async fn serve(api: Arc<FakeApi>) -> String {
        let app = Router::new()
            .route("/api/v1/upload/", post(upload))
            .route("/api/v1/status/{id}", get(status))
            .route("/api/v1/retrieve/{id}", get(retrieve))
            .with_state(api);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}/")
    }

    fn client(timeout: Duration) -> HttpExtractionClient {
        HttpExtractionClient::new(
            "/api/v1",
            "eval_testing",
            PollPolicy::new(Duration::from_millis(10), timeout),
        )
        .expect("client")
    }

    fn request(endpoint: String) -> ExtractionRequest {
        ExtractionRequest {
            document: Bytes::from_static(b"%PDF-1.4 test"),
            filename: "doc.pdf".into(),
            endpoint,
            extraction_types: vec!["patient_profile".into(), "allergy".into()],
            auth_token: Some("secret".into()),
        }
    }

    #[tokio::test]
    async fn runs_the_full_job_protocol() {
        let api = Arc::new(FakeApi::new(vec![
            (StatusCode::SERVICE_UNAVAILABLE, json!({"detail": "warming up"})),
            (StatusCode::OK, json!({"status": "processing"})),
            (StatusCode::OK, json!({"status": "Done"})),
        ]));
        let endpoint = serve(Arc::clone(&api)).await;

        let result = client(Duration::from_secs(5))
            .extract(request(endpoint))
            .await
            .expect("extraction succeeds");

        assert_eq!(result["extracted_data"]["patient_profile"]["name"], "Jane");
        assert_eq!(result["job"], "4242");
        assert_eq!(api.polls.load(Ordering::SeqCst), 3);

        let recorded = api.recorded.lock().await;
        assert_eq!(
            recorded.query.as_deref(),
            Some("extraction_types=patient_profile&extraction_types=allergy&datacontext=eval_testing")
        );
        assert_eq!(recorded.authorization.as_deref(), Some("Bearer secret"));
        assert_eq!(recorded.file_name.as_deref(), Some("doc.pdf"));
        assert_eq!(recorded.file_bytes, 13);
        assert!(recorded.status_job_ids.iter().all(|id| id == "4242"));
    }

    #[tokio::test]
    async fn failed_job_is_not_retrieved() {
        let api = Arc::new(FakeApi::new(vec![(
            StatusCode::OK,
            json!({"status": "ERROR", "detail": "unreadable"}),
        )]));
        let endpoint = serve(Arc::clone(&api)).await;

        let err = client(Duration::from_secs(5))
            .extract(request(endpoint))
            .await
            .expect_err("job fails");

        assert!(matches!(err, ExtractionError::ExtractionFailed { .. }));
        assert_eq!(api.retrieves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_upload_is_a_hard_failure() {
        let mut fake = FakeApi::new(Vec::new());
        fake.upload_status = StatusCode::INTERNAL_SERVER_ERROR;
        let api = Arc::new(fake);
        let endpoint = serve(Arc::clone(&api)).await;

        let err = client(Duration::from_secs(5))
            .extract(request(endpoint))
            .await
            .expect_err("upload rejected");

        assert!(matches!(err, ExtractionError::Upload { status: 500, .. }));
        assert_eq!(api.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pending_job_times_out() {
        let api = Arc::new(FakeApi::new(vec![(
            StatusCode::OK,
            json!({"status": "queued"}),
        )]));
        let endpoint = serve(Arc::clone(&api)).await;

        let err = client(Duration::from_millis(100))
            .extract(request(endpoint))
            .await
            .expect_err("times out");

        match err {
            ExtractionError::ExtractionTimeout { last_status, .. } => {
                assert_eq!(last_status, "queued");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(api.retrieves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hung_status_request_still_times_out() {
        let mut fake = FakeApi::new(vec![(StatusCode::OK, json!({"status": "done"}))]);
        fake.status_delay = Duration::from_secs(3600);
        let api = Arc::new(fake);
        let endpoint = serve(Arc::clone(&api)).await;

        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            client(Duration::from_millis(200)).extract(request(endpoint)),
        )
        .await
        .expect("extract returns within the deadline");

        match outcome {
            Err(ExtractionError::ExtractionTimeout { last_status, .. }) => {
                assert_eq!(last_status, STALLED_STATUS);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(api.retrieves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_endpoint_is_rejected_before_any_request() {
        let err = client(Duration::from_secs(1))
            .extract(request("not a url".into()))
            .await
            .expect_err("invalid endpoint");
        assert!(matches!(err, ExtractionError::InvalidEndpoint(_)));
    }

    #[test]
    fn job_ids_come_from_known_keys() {
        assert_eq!(job_id_from_upload(&json!({"guid": "abc"})), Some("abc".into()));
        assert_eq!(job_id_from_upload(&json!({"id": "", "job_id": 7})), Some("7".into()));
        assert_eq!(job_id_from_upload(&json!({"JOB_ID": "x-1"})), Some("x-1".into()));
        assert_eq!(job_id_from_upload(&json!({"jobid": "y"})), Some("y".into()));
        assert_eq!(job_id_from_upload(&json!({"status": "queued"})), None);
        assert_eq!(job_id_from_upload(&json!(["guid"])), None);
    }

    #[test]
    fn api_prefix_is_normalized() {
        let client = HttpExtractionClient::new("api/v2/", "ctx", PollPolicy::default())
            .expect("client");
        assert_eq!(
            client.api_base("https://extract.example.com/").expect("base"),
            "https://extract.example.com/api/v2"
        );
        assert!(client.api_base("ftp://extract.example.com").is_err());
    }
}
