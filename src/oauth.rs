/*!
Generic authorization-code OAuth client.

Every platform speaks the same grant shapes; what differs is the endpoint
URLs, the scope set, and whether client credentials travel in a Basic header
or in the form body. Those differences live in the per-platform [`Provider`]
table, platform-specific profile parsing in [`extract_profile_id`].
*/
use cached::Cached;

use crate::models::Platform;
use crate::{se, utils, ClientCreds, CONFIG, LOG};

/// How client credentials are presented to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthStyle {
    /// `Authorization: Basic base64(id:secret)` (spotify)
    BasicHeader,
    /// `client_id`/`client_secret` form fields (google and the rest)
    BodyParams,
}

pub struct Provider {
    pub platform: Platform,
    pub authorize_url: &'static str,
    pub token_url: &'static str,
    /// whoami endpoint for capturing the platform-side account id.
    /// None for platforms without a usable profile lookup.
    pub profile_url: Option<&'static str>,
    /// pre-encoded scope list for the authorize redirect
    pub scopes: &'static str,
    pub auth_style: AuthStyle,
    /// extra query params some platforms need on the authorize URL
    pub extra_authorize_params: &'static str,
}

pub fn provider(platform: Platform) -> Provider {
    match platform {
        Platform::Spotify => Provider {
            platform,
            authorize_url: "https://accounts.spotify.com/authorize",
            token_url: "https://accounts.spotify.com/api/token",
            profile_url: Some("https://api.spotify.com/v1/me"),
            scopes: "user-read-email%20playlist-read-private%20user-library-read%20user-follow-read",
            auth_style: AuthStyle::BasicHeader,
            extra_authorize_params: "",
        },
        Platform::Youtube => Provider {
            platform,
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth",
            token_url: "https://oauth2.googleapis.com/token",
            profile_url: Some(
                "https://www.googleapis.com/youtube/v3/channels?part=id&mine=true",
            ),
            scopes: "https://www.googleapis.com/auth/youtube.readonly",
            auth_style: AuthStyle::BodyParams,
            // google only hands out a refresh token when consent is forced
            extra_authorize_params: "&access_type=offline&prompt=consent",
        },
        Platform::AppleMusic => Provider {
            platform,
            authorize_url: "https://appleid.apple.com/auth/authorize",
            token_url: "https://appleid.apple.com/auth/token",
            profile_url: None,
            scopes: "name%20email",
            auth_style: AuthStyle::BodyParams,
            extra_authorize_params: "&response_mode=query",
        },
        Platform::Audiomack => Provider {
            platform,
            authorize_url: "https://audiomack.com/oauth/authenticate",
            token_url: "https://api.audiomack.com/v1/oauth/token",
            profile_url: Some("https://api.audiomack.com/v1/user"),
            scopes: "basic",
            auth_style: AuthStyle::BodyParams,
            extra_authorize_params: "",
        },
        Platform::Boomplay => Provider {
            platform,
            authorize_url: "https://open.boomplay.com/oauth/authorize",
            token_url: "https://open.boomplay.com/oauth/token",
            profile_url: Some("https://open.boomplay.com/api/user"),
            scopes: "basic",
            auth_style: AuthStyle::BodyParams,
            extra_authorize_params: "",
        },
        Platform::Soundcloud => Provider {
            platform,
            authorize_url: "https://secure.soundcloud.com/authorize",
            token_url: "https://secure.soundcloud.com/oauth/token",
            profile_url: Some("https://api.soundcloud.com/me"),
            scopes: "non-expiring",
            auth_style: AuthStyle::BodyParams,
            extra_authorize_params: "",
        },
    }
}

#[derive(serde::Deserialize, Debug)]
pub struct TokenGrant {
    pub access_token: String,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
}

#[derive(serde::Serialize)]
struct CodeParams<'a> {
    grant_type: &'a str,
    code: &'a str,
    redirect_uri: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<&'a str>,
}

#[derive(serde::Serialize)]
struct RefreshParams<'a> {
    grant_type: &'a str,
    refresh_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<&'a str>,
}

async fn token_request<P: serde::Serialize>(
    provider: &Provider,
    creds: &ClientCreds,
    params: &P,
) -> crate::Result<TokenGrant> {
    let mut req = surf::post(provider.token_url)
        .body(surf::Body::from_form(params).map_err(|e| se!("form encode error {}", e))?);
    if provider.auth_style == AuthStyle::BasicHeader {
        let basic = base64::encode(format!("{}:{}", creds.id, creds.secret).as_bytes());
        req = req.header("authorization", format!("Basic {}", basic));
    }
    let mut resp = req
        .send()
        .await
        .map_err(|e| se!("token endpoint request error {:?}", e))?;
    let status = resp.status();
    let body = resp
        .body_string()
        .await
        .map_err(|e| se!("token endpoint read error {:?}", e))?;
    if !status.is_success() {
        slog::error!(
            LOG, "token exchange failed";
            "platform" => provider.platform.as_str(),
            "status" => u16::from(status),
            "body" => &body,
        );
        return Err(se!(
            "{} token endpoint returned {}: {}",
            provider.platform,
            status,
            utils::truncate(&body, 200)
        )
        .into());
    }
    serde_json::from_str(&body)
        .map_err(|e| se!("token endpoint json parse error {}", e).into())
}

/// Exchange an authorization code for an access/refresh token pair.
/// The redirect_uri sent here must match the authorize-time value
/// byte-for-byte or the platform rejects the grant.
pub async fn exchange_code(
    provider: &Provider,
    creds: &ClientCreds,
    code: &str,
) -> crate::Result<TokenGrant> {
    let (client_id, client_secret) = body_creds(provider, creds);
    let redirect_uri = CONFIG.callback_url(provider.platform);
    let params = CodeParams {
        grant_type: "authorization_code",
        code,
        redirect_uri: &redirect_uri,
        client_id,
        client_secret,
    };
    token_request(provider, creds, &params).await
}

/// One-shot refresh-token exchange. No retries: a failure here means
/// the caller should be told to reconnect.
pub async fn refresh_grant(
    provider: &Provider,
    creds: &ClientCreds,
    refresh_token: &str,
) -> crate::Result<TokenGrant> {
    let (client_id, client_secret) = body_creds(provider, creds);
    let params = RefreshParams {
        grant_type: "refresh_token",
        refresh_token,
        client_id,
        client_secret,
    };
    token_request(provider, creds, &params).await
}

fn body_creds<'a>(
    provider: &Provider,
    creds: &'a ClientCreds,
) -> (Option<&'a str>, Option<&'a str>) {
    match provider.auth_style {
        AuthStyle::BodyParams => (Some(creds.id.as_str()), Some(creds.secret.as_str())),
        AuthStyle::BasicHeader => (None, None),
    }
}

/// Look up the platform-side account/channel id for a fresh grant.
/// Callers tolerate this failing; a connection without a platform
/// user id is still usable.
pub async fn platform_user_id(
    provider: &Provider,
    access_token: &str,
) -> crate::Result<Option<String>> {
    let url = match provider.profile_url {
        Some(url) => url,
        None => return Ok(None),
    };
    let mut resp = surf::get(url)
        .header("authorization", format!("Bearer {}", access_token))
        .send()
        .await
        .map_err(|e| se!("profile request error {:?}", e))?;
    if !resp.status().is_success() {
        return Err(se!(
            "{} profile endpoint returned {}",
            provider.platform,
            resp.status()
        )
        .into());
    }
    let v: serde_json::Value = resp
        .body_json()
        .await
        .map_err(|e| se!("profile json error {}", e))?;
    Ok(extract_profile_id(provider.platform, &v))
}

/// Pick the account identifier out of a platform's whoami payload.
pub fn extract_profile_id(platform: Platform, v: &serde_json::Value) -> Option<String> {
    let id = match platform {
        // the channels listing nests the id per item
        Platform::Youtube => &v["items"][0]["id"],
        _ => &v["id"],
    };
    match id {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The `state` parameter: a URL-safe envelope that carries the initiating
/// portal user across the redirect round-trip. The nonce is held one-time
/// server-side and consumed on callback.
#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StateToken {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

pub async fn new_state_token(user_id: &str, purpose: Option<String>) -> crate::Result<String> {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let token = StateToken {
        user_id: user_id.to_string(),
        purpose,
        nonce: Some(nonce),
    };
    let s = serde_json::to_string(&token).map_err(|e| se!("state token json error {}", e))?;
    let s = base64::encode_config(&s, base64::URL_SAFE_NO_PAD);
    let mut lock = crate::STATE_KEYS.lock().await;
    lock.cache_set(s.clone(), ());
    Ok(s)
}

/// Decode a callback `state` value. Frontend-relayed callbacks may pass the
/// bare user id instead of an envelope; that form is accepted as-is.
pub fn decode_state(raw: &str) -> StateToken {
    if let Ok(bytes) = base64::decode_config(raw, base64::URL_SAFE_NO_PAD) {
        if let Ok(s) = String::from_utf8(bytes) {
            if let Ok(token) = serde_json::from_str::<StateToken>(&s) {
                return token;
            }
        }
    }
    StateToken {
        user_id: raw.to_string(),
        purpose: None,
        nonce: None,
    }
}

/// Consume the one-time cache entry for an issued state value.
/// Returns false for replayed or expired states.
pub async fn consume_state(raw: &str) -> bool {
    let mut lock = crate::STATE_KEYS.lock().await;
    lock.cache_remove(&raw.to_string()).is_some()
}

/// Authorization URL the user's browser is sent to.
pub fn authorize_redirect_url(provider: &Provider, creds: &ClientCreds, state: &str) -> String {
    format!(
        "{url}?client_id={id}&response_type=code&redirect_uri={redirect}&scope={scope}&state={state}{extra}",
        url = provider.authorize_url,
        id = creds.id,
        redirect = CONFIG.callback_url(provider.platform),
        scope = provider.scopes,
        state = state,
        extra = provider.extra_authorize_params,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn state_round_trip_and_one_time_consumption() {
        let raw = new_state_token("user-abc", Some("connect".to_string()))
            .await
            .unwrap();
        let token = decode_state(&raw);
        assert_eq!(token.user_id, "user-abc");
        assert_eq!(token.purpose.as_deref(), Some("connect"));
        assert!(token.nonce.is_some());
        assert!(consume_state(&raw).await);
        // second use is a replay
        assert!(!consume_state(&raw).await);
    }

    #[test]
    fn bare_state_is_taken_as_user_id() {
        let token = decode_state("9f3c2a1d-artist");
        assert_eq!(token.user_id, "9f3c2a1d-artist");
        assert!(token.nonce.is_none());
    }

    #[test]
    fn profile_id_extraction_per_platform() {
        let spotify = serde_json::json!({ "id": "sp_123", "display_name": "KB" });
        assert_eq!(
            extract_profile_id(Platform::Spotify, &spotify).as_deref(),
            Some("sp_123")
        );

        let youtube = serde_json::json!({ "items": [{ "id": "UCabc" }] });
        assert_eq!(
            extract_profile_id(Platform::Youtube, &youtube).as_deref(),
            Some("UCabc")
        );

        let soundcloud = serde_json::json!({ "id": 4417 });
        assert_eq!(
            extract_profile_id(Platform::Soundcloud, &soundcloud).as_deref(),
            Some("4417")
        );

        let empty = serde_json::json!({});
        assert_eq!(extract_profile_id(Platform::Spotify, &empty), None);
    }

    #[test]
    fn every_platform_has_a_provider_entry() {
        for p in [
            Platform::Spotify,
            Platform::AppleMusic,
            Platform::Youtube,
            Platform::Audiomack,
            Platform::Boomplay,
            Platform::Soundcloud,
        ] {
            let entry = provider(p);
            assert_eq!(entry.platform, p);
            assert!(entry.token_url.starts_with("https://"));
        }
    }
}
