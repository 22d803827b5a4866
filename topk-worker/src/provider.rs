use std::time;

use async_trait::async_trait;
use reqwest::header;
use topk_core::IngestionEvent;
use url::Url;

use crate::error::ProviderError;

/// Fetches the normalized consumption events of one (user, provider) pair.
///
/// Provider specifics (OAuth tokens, rate limits, payload normalization) live
/// behind this trait. The worker is generic over it, so tests plug in a canned
/// adapter and production plugs in `HttpProviderAdapter`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync + 'static {
    /// Every event of `user_id` on `provider` that occurred at or after
    /// `since` (unix seconds). Events may overlap with a previous fetch.
    async fn fetch_since(
        &self,
        user_id: &str,
        provider: &str,
        since: i64,
    ) -> Result<Vec<IngestionEvent>, ProviderError>;
}

/// Client of the adapter service, which answers
/// `GET {base}/users/{user_id}/providers/{provider}/events?since={unix}` with
/// a JSON array of normalized events.
#[derive(Clone)]
pub struct HttpProviderAdapter {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpProviderAdapter {
    pub fn new(base_url: &str, request_timeout: time::Duration) -> Result<Self, ProviderError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("topk-worker")
            .timeout(request_timeout)
            .build()?;

        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ProviderError::NotABaseUrl(base_url.to_string()));
        }

        Ok(Self { client, base_url })
    }

    fn events_url(&self, user_id: &str, provider: &str, since: i64) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::NotABaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["users", user_id, "providers", provider, "events"]);
        url.query_pairs_mut()
            .append_pair("since", &since.to_string());
        Ok(url)
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn fetch_since(
        &self,
        user_id: &str,
        provider: &str,
        since: i64,
    ) -> Result<Vec<IngestionEvent>, ProviderError> {
        let url = self.events_url(user_id, provider, since)?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::UnexpectedStatus { status });
        }

        Ok(response.json::<Vec<IngestionEvent>>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn adapter(server: &MockServer) -> HttpProviderAdapter {
        HttpProviderAdapter::new(&server.base_url(), time::Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_since_decodes_events() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/users/u1/providers/spotify/events")
                .query_param("since", "1700000000");
            then.status(200).json_body(json!([
                {
                    "event_id": "spotify-u1-1",
                    "user_id": "u1",
                    "item_id": "song-1",
                    "provider": "spotify",
                    "occurred_at": 1700000100
                },
                {
                    "event_id": "spotify-u1-2",
                    "user_id": "u1",
                    "item_id": "song-2",
                    "provider": "spotify",
                    "occurred_at": 1700000200
                }
            ]));
        });

        let events = adapter(&server)
            .fetch_since("u1", "spotify", 1_700_000_000)
            .await
            .unwrap();

        mock.assert();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, "spotify-u1-1");
        assert_eq!(events[1].item_id, "song-2");
        assert_eq!(events[1].occurred_at, 1_700_000_200);
    }

    #[tokio::test]
    async fn test_error_status_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET);
            then.status(503);
        });

        let err = adapter(&server)
            .fetch_since("u1", "spotify", 0)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProviderError::UnexpectedStatus { status } if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        ));
    }

    #[tokio::test]
    async fn test_malformed_body_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET);
            then.status(200).body("not json");
        });

        let err = adapter(&server)
            .fetch_since("u1", "spotify", 0)
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::RequestError(_)));
    }

    #[test]
    fn test_events_url_keeps_base_path() {
        let adapter =
            HttpProviderAdapter::new("http://adapter:8000/v1/", time::Duration::from_secs(1))
                .unwrap();
        let url = adapter.events_url("u1", "lastfm", 42).unwrap();
        assert_eq!(
            url.as_str(),
            "http://adapter:8000/v1/users/u1/providers/lastfm/events?since=42"
        );

        // Ids are single path segments
        let url = adapter.events_url("a/b c", "lastfm", 0).unwrap();
        assert_eq!(
            url.path(),
            "/v1/users/a%2Fb%20c/providers/lastfm/events"
        );
    }

    #[test]
    fn test_rejects_unusable_base_url() {
        assert!(matches!(
            HttpProviderAdapter::new("mailto:adapter@example.com", time::Duration::from_secs(1)),
            Err(ProviderError::NotABaseUrl(_))
        ));
        assert!(matches!(
            HttpProviderAdapter::new("not a url", time::Duration::from_secs(1)),
            Err(ProviderError::InvalidUrl(_))
        ));
    }
}
