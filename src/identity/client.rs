//! REST/JSON client for the identity service.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::{
    AuthenticateUserRequest, AuthenticateUserResponse, CheckApiAccessRequest,
    CheckApiAccessResponse, CheckUserAuthorizationRequest, CheckUserAuthorizationResponse,
    IdentityError, IdentityFuture, IdentityService, PublicVerificationKey, ValidateApiKeyRequest,
    ValidateApiKeyResponse,
};

const VALIDATE_API_KEY_PATH: &str = "v1/api-keys/validate";
const CHECK_API_ACCESS_PATH: &str = "v1/api-keys/access";
const AUTHENTICATE_USER_PATH: &str = "v1/users/authenticate";
const AUTHORIZE_USER_PATH: &str = "v1/users/authorize";
const VERIFICATION_KEY_PATH: &str = "v1/keys/verification";

/// Identity service client. Every request carries a bounded timeout.
pub struct HttpIdentityClient {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpIdentityClient {
    /// Create a client rooted at `base_url` with a per-call `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        // Url::join drops the last segment unless the base ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, IdentityError> {
        self.base_url
            .join(path)
            .map_err(|e| IdentityError::Transport(format!("invalid endpoint {}: {}", path, e)))
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, IdentityError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        debug!(endpoint = %url, "calling identity service");
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Self::decode(response).await
    }

    async fn get<T>(&self, path: &str) -> Result<T, IdentityError>
    where
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        debug!(endpoint = %url, "calling identity service");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, IdentityError> {
        let status = response.status();
        if !status.is_success() {
            return Err(IdentityError::Status(status.as_u16()));
        }
        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                IdentityError::Timeout
            } else {
                IdentityError::Decode(e.to_string())
            }
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> IdentityError {
    if err.is_timeout() {
        IdentityError::Timeout
    } else {
        IdentityError::Transport(err.to_string())
    }
}

impl IdentityService for HttpIdentityClient {
    fn validate_api_key(
        &self,
        request: ValidateApiKeyRequest,
    ) -> IdentityFuture<'_, ValidateApiKeyResponse> {
        Box::pin(async move { self.post(VALIDATE_API_KEY_PATH, &request).await })
    }

    fn check_api_access(
        &self,
        request: CheckApiAccessRequest,
    ) -> IdentityFuture<'_, CheckApiAccessResponse> {
        Box::pin(async move { self.post(CHECK_API_ACCESS_PATH, &request).await })
    }

    fn authenticate_user(
        &self,
        request: AuthenticateUserRequest,
    ) -> IdentityFuture<'_, AuthenticateUserResponse> {
        Box::pin(async move { self.post(AUTHENTICATE_USER_PATH, &request).await })
    }

    fn check_user_authorization(
        &self,
        request: CheckUserAuthorizationRequest,
    ) -> IdentityFuture<'_, CheckUserAuthorizationResponse> {
        Box::pin(async move { self.post(AUTHORIZE_USER_PATH, &request).await })
    }

    fn public_verification_key(&self) -> IdentityFuture<'_, PublicVerificationKey> {
        Box::pin(async move { self.get(VERIFICATION_KEY_PATH).await })
    }
}
