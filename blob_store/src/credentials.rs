use async_trait::async_trait;
use data_model::BlobResult;
use reqwest::RequestBuilder;

/// Credentials this instance presents to peers and upstream relays.
#[async_trait]
pub trait ServiceCredentials: Send + Sync {
    async fn get_token(&self) -> BlobResult<Option<String>>;

    fn authentication_scheme(&self) -> &str;
}

/// A fixed token, or no authentication at all.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    scheme: String,
    token: Option<String>,
}

impl StaticCredentials {
    pub fn new(scheme: impl Into<String>, token: Option<String>) -> Self {
        Self {
            scheme: scheme.into(),
            token,
        }
    }

    pub fn anonymous() -> Self {
        Self::new("Bearer", None)
    }
}

#[async_trait]
impl ServiceCredentials for StaticCredentials {
    async fn get_token(&self) -> BlobResult<Option<String>> {
        Ok(self.token.clone())
    }

    fn authentication_scheme(&self) -> &str {
        &self.scheme
    }
}

/// Attach an `Authorization` header when the credentials carry a token.
pub async fn authorize(
    request: RequestBuilder,
    credentials: &dyn ServiceCredentials,
) -> BlobResult<RequestBuilder> {
    Ok(match credentials.get_token().await? {
        Some(token) => request.header(
            reqwest::header::AUTHORIZATION,
            format!("{} {}", credentials.authentication_scheme(), token),
        ),
        None => request,
    })
}
