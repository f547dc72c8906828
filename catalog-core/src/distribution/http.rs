use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use tracing::{debug, info};

use crate::config::{DeliveryTarget, HttpDeliverySection};

use super::{Delivery, DeliveryError, DeliveryReceipt};

const CSV_MIME: &str = "text/csv";
const MAX_ERROR_BODY: usize = 512;

/// Uploads the export to a CMS endpoint as a multipart form.
///
/// The endpoint keeps its own copy; there is no history on this target.
#[derive(Clone)]
pub struct HttpDelivery {
    client: Client,
    upload_url: String,
    field_name: String,
    file_name: String,
    token: Option<String>,
}

impl fmt::Debug for HttpDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDelivery")
            .field("upload_url", &self.upload_url)
            .field("field_name", &self.field_name)
            .field("file_name", &self.file_name)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl HttpDelivery {
    pub fn from_config(config: &HttpDeliverySection) -> Result<Self, DeliveryError> {
        url::Url::parse(&config.upload_url).map_err(|err| {
            DeliveryError::Configuration(format!("upload_url {}: {err}", config.upload_url))
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()?;
        Ok(Self {
            client,
            upload_url: config.upload_url.clone(),
            field_name: config.field_name.clone(),
            file_name: config.file_name.clone(),
            token: config.token.clone().filter(|token| !token.is_empty()),
        })
    }

    pub fn upload_url(&self) -> &str {
        &self.upload_url
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn form(&self, bytes: &[u8], history_id: &str) -> Result<Form, DeliveryError> {
        let part = Part::bytes(bytes.to_vec())
            .file_name(self.file_name.clone())
            .mime_str(CSV_MIME)?;
        Ok(Form::new()
            .text("history_id", history_id.to_string())
            .part(self.field_name.clone(), part))
    }
}

#[async_trait]
impl Delivery for HttpDelivery {
    fn target(&self) -> DeliveryTarget {
        DeliveryTarget::Http
    }

    async fn deliver(
        &self,
        bytes: &[u8],
        history_id: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let form = self.form(bytes, history_id)?;
        let mut request = self.client.post(&self.upload_url).multipart(form);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY).collect(),
            });
        }
        info!(
            url = %self.upload_url,
            status = status.as_u16(),
            bytes = bytes.len(),
            "catalog uploaded"
        );
        Ok(DeliveryReceipt {
            target: self.target().to_string(),
            canonical: self.upload_url.clone(),
            history: None,
            bytes: bytes.len(),
        })
    }

    async fn prune_history(&self, keep: usize) -> Result<Vec<String>, DeliveryError> {
        debug!(keep, "http target keeps no history, nothing to prune");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CSV: &[u8] = b"id,name,price\n1,Product,100\n";

    fn section(url: &str, token: Option<&str>) -> HttpDeliverySection {
        HttpDeliverySection {
            upload_url: url.to_string(),
            field_name: "file".into(),
            file_name: "catalog.csv".into(),
            token_env: Some("CATALOG_UPLOAD_TOKEN".into()),
            token: token.map(str::to_string),
            timeout_seconds: 30,
        }
    }

    #[test]
    fn rejects_invalid_upload_url() {
        let err = HttpDelivery::from_config(&section("not a url", None)).unwrap_err();
        assert!(matches!(err, DeliveryError::Configuration(_)));
    }

    #[test]
    fn empty_token_is_treated_as_absent() {
        let section_without_token = section("https://cms.example.com/upload", Some(""));
        let delivery = HttpDelivery::from_config(&section_without_token).unwrap();
        assert!(!delivery.has_token());
        let debug = format!(
            "{:?}",
            HttpDelivery::from_config(&section("https://cms.example.com/upload", Some("s3cret")))
                .unwrap()
        );
        assert!(!debug.contains("s3cret"));
    }

    #[tokio::test]
    async fn prune_is_a_no_op() {
        let delivery =
            HttpDelivery::from_config(&section("https://cms.example.com/upload", None)).unwrap();
        assert!(delivery.prune_history(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uploads_multipart_form_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/upload", server.uri());
        let delivery = HttpDelivery::from_config(&section(&url, Some("s3cret"))).unwrap();
        let receipt = delivery.deliver(CSV, "20240301T120000Z").await.unwrap();

        assert_eq!(receipt.target, "http");
        assert_eq!(receipt.canonical, url);
        assert_eq!(receipt.history, None);
        assert_eq!(receipt.bytes, CSV.len());

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let content_type = requests[0]
            .headers
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("multipart/form-data"));
        let body = String::from_utf8_lossy(&requests[0].body).into_owned();
        assert!(body.contains("name=\"history_id\""));
        assert!(body.contains("20240301T120000Z"));
        assert!(body.contains("name=\"file\"; filename=\"catalog.csv\""));
        assert!(body.to_ascii_lowercase().contains("content-type: text/csv"));
        assert!(body.contains("id,name,price\n1,Product,100\n"));
    }

    #[tokio::test]
    async fn omits_authorization_without_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let url = format!("{}/upload", server.uri());
        let delivery = HttpDelivery::from_config(&section(&url, None)).unwrap();
        delivery.deliver(CSV, "20240301T120000Z").await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn non_success_status_is_rejected_with_truncated_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(500).set_body_string("e".repeat(2000)))
            .mount(&server)
            .await;

        let url = format!("{}/upload", server.uri());
        let delivery = HttpDelivery::from_config(&section(&url, Some("s3cret"))).unwrap();
        let err = delivery.deliver(CSV, "20240301T120000Z").await.unwrap_err();

        match err {
            DeliveryError::Rejected { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body.len(), MAX_ERROR_BODY);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
