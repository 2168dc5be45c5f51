//! ArcGIS REST implementation of [`FeatureService`].

use crate::error::{Error, Result};
use crate::gis::{temp_download_name, AttachmentInfo, Collection, Feature, FeatureService, Layer};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Connection options for a portal.
#[derive(Debug, Clone)]
pub struct PortalOptions {
    /// Portal root, e.g. `https://www.arcgis.com`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Validate the portal's TLS certificate.
    pub cert_verification: bool,
    pub timeout: Duration,
}

impl Default for PortalOptions {
    fn default() -> Self {
        Self {
            url: "https://www.arcgis.com".to_string(),
            username: None,
            password: None,
            cert_verification: true,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Client for an ArcGIS Online or Enterprise portal.
///
/// Signed-in clients keep their credentials and sign in again once when the
/// portal reports an expired or missing token (codes 498 and 499).
pub struct ArcGisClient {
    http: reqwest::Client,
    portal: String,
    credentials: Option<(String, String)>,
    token: RwLock<Option<String>>,
}

#[derive(Clone, Copy)]
enum Verb {
    Get,
    PostForm,
}

#[derive(Deserialize)]
struct ServiceError {
    code: Option<i64>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Deserialize)]
struct ItemResponse {
    id: String,
    #[serde(default)]
    title: String,
    url: Option<String>,
}

#[derive(Deserialize)]
struct ServiceResponse {
    #[serde(default)]
    layers: Vec<LayerRef>,
}

#[derive(Deserialize)]
struct LayerRef {
    id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayerResponse {
    name: String,
    #[serde(default)]
    has_attachments: bool,
    object_id_field: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdsResponse {
    object_ids: Option<Vec<i64>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentsResponse {
    #[serde(default)]
    attachment_infos: Vec<AttachmentInfo>,
}

#[derive(Deserialize)]
struct FeaturesResponse {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditsResponse {
    #[serde(default)]
    update_results: Vec<EditResult>,
}

#[derive(Deserialize)]
struct EditResult {
    success: bool,
    error: Option<ServiceError>,
}

impl ArcGisClient {
    /// Build a client and, when credentials are given, obtain a token.
    pub async fn connect(opts: &PortalOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!opts.cert_verification)
            .timeout(opts.timeout)
            .build()?;

        let credentials = match (&opts.username, &opts.password) {
            (Some(username), Some(password)) if !username.is_empty() => {
                Some((username.clone(), password.clone()))
            }
            _ => None,
        };

        let client = Self {
            http,
            portal: opts.url.trim_end_matches('/').to_string(),
            credentials,
            token: RwLock::new(None),
        };

        match &client.credentials {
            Some((username, _)) => {
                client.refresh_token().await?;
                info!("Signed in to {} as {username}", client.portal);
            }
            None => info!("Connecting to {} anonymously", client.portal),
        }

        Ok(client)
    }

    async fn generate_token(&self, username: &str, password: &str) -> Result<String> {
        let url = format!("{}/sharing/rest/generateToken", self.portal);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("username", username),
                ("password", password),
                ("referer", self.portal.as_str()),
                ("expiration", "60"),
                ("f", "json"),
            ])
            .send()
            .await?
            .error_for_status()?;
        let token: TokenResponse = decode(response.json().await?)?;
        Ok(token.token)
    }

    async fn refresh_token(&self) -> Result<()> {
        let Some((username, password)) = &self.credentials else {
            return Ok(());
        };
        let token = self.generate_token(username, password).await?;
        *self.token.write().await = Some(token);
        Ok(())
    }

    /// Whether `err` calls for a new token. Anonymous clients never retry.
    fn token_expired(&self, err: &Error) -> bool {
        self.credentials.is_some()
            && matches!(err, Error::Remote { code: Some(498 | 499), .. })
    }

    async fn current_token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        verb: Verb,
        url: &str,
        extra: &[(&'static str, &str)],
    ) -> Result<T> {
        match self.try_call_json(verb, url, extra).await {
            Err(e) if self.token_expired(&e) => {
                warn!("Token rejected ({e}), signing in again");
                self.refresh_token().await?;
                self.try_call_json(verb, url, extra).await
            }
            other => other,
        }
    }

    async fn try_call_json<T: DeserializeOwned>(
        &self,
        verb: Verb,
        url: &str,
        extra: &[(&'static str, &str)],
    ) -> Result<T> {
        let token = self.current_token().await;
        let mut params: Vec<(&str, &str)> = extra.to_vec();
        params.push(("f", "json"));
        if let Some(token) = &token {
            params.push(("token", token.as_str()));
        }

        let request = match verb {
            Verb::Get => {
                debug!("GET {url}");
                self.http.get(url).query(&params)
            }
            Verb::PostForm => {
                debug!("POST {url}");
                self.http.post(url).form(&params)
            }
        };
        let response = request.send().await?.error_for_status()?;
        decode(response.json().await?)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, extra: &[(&'static str, &str)]) -> Result<T> {
        self.call_json(Verb::Get, url, extra).await
    }

    async fn fetch_layer(&self, service_url: &str, index: usize, id: i64) -> Result<Layer> {
        let url = format!("{service_url}/{id}");
        let layer: LayerResponse = self.get_json(&url, &[]).await?;
        Ok(Layer {
            index,
            id,
            name: layer.name,
            supports_attachments: layer.has_attachments,
            object_id_field: layer
                .object_id_field
                .unwrap_or_else(|| "OBJECTID".to_string()),
            url,
        })
    }

    async fn try_download(
        &self,
        layer: &Layer,
        object_id: i64,
        attachment: &AttachmentInfo,
        dest_dir: &Path,
    ) -> Result<PathBuf> {
        let url = format!("{}/{object_id}/attachments/{}", layer.url, attachment.id);
        let token = self.current_token().await;
        let mut request = self.http.get(&url);
        if let Some(token) = &token {
            request = request.query(&[("token", token.as_str())]);
        }
        let mut response = request.send().await?.error_for_status()?;
        let temp = dest_dir.join(temp_download_name());

        // Errors arrive as JSON with HTTP 200; never store them as the attachment.
        if may_be_service_error(&content_type(&response), attachment.content_type.as_deref()) {
            let body = response.bytes().await?;
            if let Ok(mut value) = serde_json::from_slice::<Value>(&body) {
                if let Some(err) = service_error(&mut value) {
                    return Err(err);
                }
            }
            if let Err(e) = tokio::fs::write(&temp, &body).await {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e.into());
            }
            return Ok(temp);
        }

        let mut file = tokio::fs::File::create(&temp).await?;
        let written: Result<()> = async {
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = written {
            drop(file);
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
        Ok(temp)
    }
}

#[async_trait]
impl FeatureService for ArcGisClient {
    async fn get_collection(&self, id: &str) -> Result<Collection> {
        let url = format!("{}/sharing/rest/content/items/{id}", self.portal);
        let item: ItemResponse = match self.get_json(&url, &[]).await {
            Ok(item) => item,
            Err(Error::Remote {
                code: Some(400 | 403 | 404),
                message,
            }) => return Err(Error::NotFound(format!("{id} ({message})"))),
            Err(e) => return Err(e),
        };

        let service_url = item
            .url
            .ok_or_else(|| Error::Parse(format!("item {} has no service url", item.id)))?;
        let service_url = service_url.trim_end_matches('/').to_string();
        let service: ServiceResponse = self.get_json(&service_url, &[]).await?;

        let mut layers = Vec::with_capacity(service.layers.len());
        for (index, layer) in service.layers.iter().enumerate() {
            layers.push(self.fetch_layer(&service_url, index, layer.id).await?);
        }

        Ok(Collection {
            id: item.id,
            title: item.title,
            layers,
        })
    }

    async fn query_object_ids(&self, layer: &Layer, where_clause: &str) -> Result<Vec<i64>> {
        let url = format!("{}/query", layer.url);
        let ids: IdsResponse = self
            .get_json(&url, &[("where", where_clause), ("returnIdsOnly", "true")])
            .await?;
        Ok(ids.object_ids.unwrap_or_default())
    }

    async fn list_attachments(&self, layer: &Layer, object_id: i64) -> Result<Vec<AttachmentInfo>> {
        let url = format!("{}/{object_id}/attachments", layer.url);
        let response: AttachmentsResponse = self.get_json(&url, &[]).await?;
        Ok(response.attachment_infos)
    }

    async fn download_attachment(
        &self,
        layer: &Layer,
        object_id: i64,
        attachment: &AttachmentInfo,
        dest_dir: &Path,
    ) -> Result<PathBuf> {
        match self.try_download(layer, object_id, attachment, dest_dir).await {
            Err(e) if self.token_expired(&e) => {
                warn!("Token rejected ({e}), signing in again");
                self.refresh_token().await?;
                self.try_download(layer, object_id, attachment, dest_dir).await
            }
            other => other,
        }
    }

    async fn query_features(&self, layer: &Layer, where_clause: &str) -> Result<Vec<Feature>> {
        let url = format!("{}/query", layer.url);
        let response: FeaturesResponse = self
            .get_json(
                &url,
                &[
                    ("where", where_clause),
                    ("outFields", "*"),
                    ("returnGeometry", "true"),
                    ("outSR", "4326"),
                ],
            )
            .await?;
        Ok(response.features)
    }

    async fn update_attribute(
        &self,
        layer: &Layer,
        object_id: i64,
        field: &str,
        value: &str,
    ) -> Result<()> {
        let url = format!("{}/applyEdits", layer.url);
        let mut attributes = serde_json::Map::new();
        attributes.insert(layer.object_id_field.clone(), json!(object_id));
        attributes.insert(field.to_string(), json!(value));
        let updates = json!([{ "attributes": attributes }]).to_string();

        let edits: EditsResponse = self
            .call_json(Verb::PostForm, &url, &[("updates", updates.as_str())])
            .await?;

        match edits.update_results.into_iter().next() {
            Some(EditResult { success: true, .. }) => Ok(()),
            Some(EditResult { error, .. }) => Err(error.map_or_else(
                || Error::Remote {
                    code: None,
                    message: format!("update of record {object_id} failed"),
                },
                ServiceError::into_error,
            )),
            None => Err(Error::Parse(format!(
                "no update result returned for record {object_id}"
            ))),
        }
    }
}

impl ServiceError {
    fn into_error(self) -> Error {
        let message = if self.details.is_empty() {
            self.message
        } else {
            format!("{} ({})", self.message, self.details.join("; "))
        };
        Error::Remote {
            code: self.code,
            message,
        }
    }
}

/// The REST API reports failures as `{"error": {...}}` with HTTP 200.
fn service_error(value: &mut Value) -> Option<Error> {
    let err = value.get_mut("error").map(Value::take)?;
    Some(match serde_json::from_value::<ServiceError>(err) {
        Ok(err) => err.into_error(),
        Err(e) => e.into(),
    })
}

fn decode<T: DeserializeOwned>(mut value: Value) -> Result<T> {
    if let Some(err) = service_error(&mut value) {
        return Err(err);
    }
    Ok(serde_json::from_value(value)?)
}

fn content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// A JSON or plain-text response is checked for an error payload unless the
/// attachment itself is declared as JSON or text.
fn may_be_service_error(response_type: &str, declared: Option<&str>) -> bool {
    let textual = |ct: &str| {
        let ct = ct.trim().to_ascii_lowercase();
        ct.starts_with("application/json") || ct.starts_with("text/plain")
    };
    textual(response_type) && !declared.is_some_and(textual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_surfaces_error_payload() {
        let value = json!({
            "error": {"code": 400, "message": "Item does not exist or is inaccessible.", "details": []}
        });
        let err = decode::<ItemResponse>(value).err().unwrap();
        assert!(matches!(err, Error::Remote { code: Some(400), .. }));
    }

    #[test]
    fn decode_joins_error_details() {
        let value = json!({
            "error": {"code": 400, "message": "Unable to complete operation.", "details": ["Invalid where clause"]}
        });
        let err = decode::<IdsResponse>(value).err().unwrap();
        assert_eq!(
            err.to_string(),
            "service error 400: Unable to complete operation. (Invalid where clause)"
        );
    }

    #[test]
    fn null_object_ids_mean_no_records() {
        let ids: IdsResponse =
            decode(json!({"objectIdFieldName": "objectid", "objectIds": null})).unwrap();
        assert!(ids.object_ids.unwrap_or_default().is_empty());
    }

    #[test]
    fn json_responses_are_checked_for_errors() {
        assert!(may_be_service_error("application/json; charset=utf-8", Some("image/jpeg")));
        assert!(may_be_service_error("text/plain", None));
        assert!(!may_be_service_error("image/jpeg", Some("image/jpeg")));
        assert!(!may_be_service_error("application/octet-stream", None));
    }

    #[test]
    fn declared_json_attachments_are_kept() {
        assert!(!may_be_service_error("application/json", Some("application/json")));
        assert!(!may_be_service_error("text/plain", Some("text/plain")));
    }

    #[test]
    fn layer_response_defaults() {
        let layer: LayerResponse = decode(json!({"name": "Sightings"})).unwrap();
        assert!(!layer.has_attachments);
        assert!(layer.object_id_field.is_none());
    }
}
