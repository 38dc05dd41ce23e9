//! HTTP client for the session REST surface.

use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tableside_shared::{
    cart_add_path, cart_clear_path, cart_path, cart_remove_path, cart_update_path, lock_path,
    session_path, unlock_path, AddCartItem, ApiError, CartItem, CartSnapshot, SessionState,
    UpdateCartItem,
};

/// HTTP client for point-in-time reads and mutation requests.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            token: None,
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if self.base_url.is_empty() {
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            }
        } else {
            let base = self.base_url.trim_end_matches('/');
            let path = path.trim_start_matches('/');
            format!("{base}/{path}")
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let rb = self.client.request(method, self.url(path));
        match &self.token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    /// Send the request and return the body of a 2xx response.
    async fn execute(rb: RequestBuilder) -> Result<String, ApiError> {
        let resp = rb.send().await.map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(ApiError::Http { status, body: text });
        }
        Ok(text)
    }

    fn decode<TRes: DeserializeOwned>(text: &str) -> Result<TRes, ApiError> {
        let text = if text.trim().is_empty() { "null" } else { text };
        serde_json::from_str(text).map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    fn with_json<TReq: Serialize>(rb: RequestBuilder, body: &TReq) -> Result<RequestBuilder, ApiError> {
        let body_bytes = serde_json::to_vec(body).map_err(|e| ApiError::Deserialize(e.to_string()))?;
        Ok(rb
            .body(body_bytes)
            .header(reqwest::header::CONTENT_TYPE, "application/json"))
    }

    /// Make a GET request
    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let text = Self::execute(self.request(Method::GET, path)).await?;
        Self::decode(&text)
    }

    /// Make a POST request with JSON body
    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let rb = Self::with_json(self.request(Method::POST, path), body)?;
        let text = Self::execute(rb).await?;
        Self::decode(&text)
    }

    /// Make a PATCH request with JSON body
    pub async fn patch_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let rb = Self::with_json(self.request(Method::PATCH, path), body)?;
        let text = Self::execute(rb).await?;
        Self::decode(&text)
    }

    /// Make a POST request without a body, ignoring the response content
    pub async fn post_empty(&self, path: &str) -> Result<(), ApiError> {
        Self::execute(self.request(Method::POST, path)).await.map(|_| ())
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        Self::execute(self.request(Method::DELETE, path)).await.map(|_| ())
    }

    // --- Session API methods ---

    /// Full session state (session, participants, orders)
    pub async fn get_session(&self, session_id: &str) -> Result<SessionState, ApiError> {
        self.get_json(&session_path(session_id)).await
    }

    /// Point-in-time read of the shared cart
    pub async fn get_cart(&self, session_id: &str) -> Result<CartSnapshot, ApiError> {
        self.get_json(&cart_path(session_id)).await
    }

    pub async fn add_cart_item(
        &self,
        session_id: &str,
        item: &AddCartItem,
    ) -> Result<CartItem, ApiError> {
        self.post_json(&cart_add_path(session_id), item).await
    }

    pub async fn update_cart_item(
        &self,
        session_id: &str,
        item_id: &str,
        update: &UpdateCartItem,
    ) -> Result<CartItem, ApiError> {
        self.patch_json(&cart_update_path(session_id, item_id), update)
            .await
    }

    pub async fn remove_cart_item(&self, session_id: &str, item_id: &str) -> Result<(), ApiError> {
        self.delete(&cart_remove_path(session_id, item_id)).await
    }

    /// Remove every line owned by the caller
    pub async fn clear_own_cart_items(&self, session_id: &str) -> Result<(), ApiError> {
        self.delete(&cart_clear_path(session_id)).await
    }

    pub async fn lock_session(&self, session_id: &str) -> Result<(), ApiError> {
        self.post_empty(&lock_path(session_id)).await
    }

    pub async fn unlock_session(&self, session_id: &str) -> Result<(), ApiError> {
        self.post_empty(&unlock_path(session_id)).await
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}
