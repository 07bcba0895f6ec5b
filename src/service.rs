use sqlx::PgPool;

use crate::models::{Platform, PlatformConnection};
use crate::{crypto, mailer, oauth, resp, se, sync, utils, CONFIG, LOG};

#[derive(Clone)]
struct Context {
    pool: PgPool,
}

pub async fn start(pool: PgPool) -> crate::Result<()> {
    let ctx = Context { pool };
    let mut app = tide::with_state(ctx);

    // callbacks arrive cross-origin from the portal frontend; preflights
    // are answered by the cors layer
    let cors = tide::security::CorsMiddleware::new()
        .allow_origin(tide::security::Origin::from("*"))
        .allow_methods(
            "GET, POST, OPTIONS"
                .parse::<tide::http::headers::HeaderValue>()
                .expect("invalid cors methods"),
        )
        .allow_headers(
            "authorization, content-type"
                .parse::<tide::http::headers::HeaderValue>()
                .expect("invalid cors headers"),
        );
    app.with(cors);
    app.with(crate::logging::LogMiddleware::new());

    app.at("/").get(status);
    app.at("/status").get(status);
    app.at("/connect/:platform").get(connect);
    app.at("/callback/:platform")
        .get(oauth_callback)
        .post(oauth_callback);
    app.at("/sync").post(sync_any);
    app.at("/sync/:platform").post(sync_platform);
    app.at("/notify").post(notify);

    slog::info!(LOG, "running at {}", CONFIG.host());
    app.listen(CONFIG.host()).await?;
    Ok(())
}

#[derive(serde::Serialize)]
struct Status<'a> {
    ok: &'a str,
    version: &'a str,
}

async fn status(_req: tide::Request<Context>) -> tide::Result {
    Ok(resp!(json => Status {
        ok: "ok",
        version: &CONFIG.version
    }))
}

#[derive(serde::Deserialize)]
struct ConnectParams {
    user_id: String,
    purpose: Option<String>,
}

/// Send the user's browser to the platform's authorization page with a
/// freshly issued state envelope carrying their portal identity.
async fn connect(req: tide::Request<Context>) -> tide::Result {
    let platform = match parse_platform(req.param("platform")?) {
        Ok(p) => p,
        Err(r) => return Ok(r),
    };
    let params: ConnectParams = match req.query() {
        Ok(p) => p,
        Err(_) => return Ok(resp!(status => 400, error => "user_id is required")),
    };
    let creds = match CONFIG.client_creds(platform) {
        Ok(c) => c,
        Err(e) => return Ok(unconfigured(platform, e)),
    };
    let provider = oauth::provider(platform);
    let state = match oauth::new_state_token(&params.user_id, params.purpose).await {
        Ok(s) => s,
        Err(e) => {
            slog::error!(LOG, "error issuing state token {}", e);
            return Ok(resp!(status => 500, error => "failed to issue state token"));
        }
    };
    slog::info!(
        LOG, "redirecting to platform authorization";
        "platform" => platform.as_str(),
        "user_id" => &params.user_id,
    );
    Ok(tide::Redirect::new(oauth::authorize_redirect_url(&provider, &creds, &state)).into())
}

#[derive(Debug, Default, serde::Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Reject a callback before any token exchange when the platform reported
/// an error or when code/state are missing.
fn check_callback(
    platform: Platform,
    params: &CallbackParams,
) -> std::result::Result<(String, String), String> {
    if let Some(err) = params.error.as_deref() {
        if !err.is_empty() {
            return Err(format!(
                "{} reported an authorization error: {}",
                platform, err
            ));
        }
    }
    match (params.code.as_deref(), params.state.as_deref()) {
        (Some(code), Some(state)) if !code.is_empty() && !state.is_empty() => {
            Ok((code.to_string(), state.to_string()))
        }
        _ => Err("missing code or state".to_string()),
    }
}

/// Complete the authorization-code flow for one platform. The platform
/// redirects here with `code`/`state`/`error` in the query string; the
/// portal frontend may instead relay the same fields in a POST body.
async fn oauth_callback(mut req: tide::Request<Context>) -> tide::Result {
    let platform = match parse_platform(req.param("platform")?) {
        Ok(p) => p,
        Err(r) => return Ok(r),
    };
    let params: CallbackParams = if req.method() == tide::http::Method::Post {
        // malformed bodies fall through to the missing-field check
        req.body_json().await.unwrap_or_default()
    } else {
        req.query().unwrap_or_default()
    };

    let (code, state_raw) = match check_callback(platform, &params) {
        Ok(parts) => parts,
        Err(msg) => return Ok(resp!(status => 400, error => msg)),
    };

    let state = oauth::decode_state(&state_raw);
    if state.nonce.is_some() && !oauth::consume_state(&state_raw).await {
        return Ok(resp!(status => 400, error => "expired or replayed state token"));
    }
    if state.user_id.trim().is_empty() {
        return Ok(resp!(status => 400, error => "missing code or state"));
    }

    let creds = match CONFIG.client_creds(platform) {
        Ok(c) => c,
        Err(e) => return Ok(unconfigured(platform, e)),
    };
    let provider = oauth::provider(platform);
    let grant = match oauth::exchange_code(&provider, &creds, &code).await {
        Ok(g) => g,
        Err(e) => return Ok(resp!(status => 400, error => e.to_string())),
    };

    // best-effort: a connection without a platform-side id is still usable
    let platform_user_id = match oauth::platform_user_id(&provider, &grant.access_token).await {
        Ok(id) => id,
        Err(e) => {
            slog::warn!(
                LOG, "profile lookup failed, continuing";
                "platform" => platform.as_str(),
                "err" => e.to_string(),
            );
            None
        }
    };

    let ctx = req.state();
    match upsert_connection(
        &ctx.pool,
        &state.user_id,
        platform,
        &grant,
        platform_user_id.as_deref(),
    )
    .await
    {
        Ok(conn) => {
            slog::info!(
                LOG, "platform connected";
                "user_id" => &conn.user_id,
                "platform" => platform.as_str(),
                "purpose" => state.purpose.as_deref().unwrap_or("connect"),
            );
            Ok(resp!(json => serde_json::json!({
                "success": true,
                "message": format!("{} account connected", platform),
            })))
        }
        Err(e) => {
            slog::error!(LOG, "connection upsert failed {}", e);
            Ok(resp!(status => 500, error => "failed to store platform connection"))
        }
    }
}

async fn upsert_connection(
    pool: &PgPool,
    user_id: &str,
    platform: Platform,
    grant: &oauth::TokenGrant,
    platform_user_id: Option<&str>,
) -> crate::Result<PlatformConnection> {
    let access = crypto::seal_str(&grant.access_token)?;
    let refresh = match grant.refresh_token.as_deref() {
        Some(t) => Some(crypto::seal_str(t)?),
        None => None,
    };
    let access_expires = utils::epoch_expiration(grant.expires_in.unwrap_or(3600))?;
    // exactly one write per successful callback. Concurrent callbacks for
    // the same (user, platform) race and the last write wins.
    sqlx::query_as::<_, PlatformConnection>(
        "
        insert into platform_connections (
            user_id, platform,
            access_token, access_nonce,
            refresh_token, refresh_nonce,
            access_expires, platform_user_id, active
        )
        values ($1, $2, $3, $4, $5, $6, $7, $8, true)
        on conflict (user_id, platform) do update set
        access_token = excluded.access_token, access_nonce = excluded.access_nonce,
        refresh_token = coalesce(excluded.refresh_token, platform_connections.refresh_token),
        refresh_nonce = coalesce(excluded.refresh_nonce, platform_connections.refresh_nonce),
        access_expires = excluded.access_expires,
        platform_user_id = coalesce(excluded.platform_user_id, platform_connections.platform_user_id),
        active = true, modified = now()
        returning *
        ",
    )
    .bind(user_id)
    .bind(platform.as_str())
    .bind(&access.value)
    .bind(&access.nonce)
    .bind(refresh.as_ref().map(|s| s.value.clone()))
    .bind(refresh.as_ref().map(|s| s.nonce.clone()))
    .bind(access_expires)
    .bind(platform_user_id)
    .fetch_one(pool)
    .await
    .map_err(|e| se!("error upserting connection {:?}", e).into())
}

#[derive(Debug, Default, serde::Deserialize)]
struct SyncParams {
    user_id: Option<String>,
    platform: Option<String>,
}

async fn sync_platform(mut req: tide::Request<Context>) -> tide::Result {
    let platform_raw = req.param("platform")?.to_string();
    let body: SyncParams = req.body_json().await.unwrap_or_default();
    run_sync(req.state(), &platform_raw, body.user_id).await
}

async fn sync_any(mut req: tide::Request<Context>) -> tide::Result {
    let body: SyncParams = req.body_json().await.unwrap_or_default();
    let platform_raw = match body.platform.as_deref() {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => return Ok(resp!(status => 400, error => "platform is required")),
    };
    run_sync(req.state(), &platform_raw, body.user_id).await
}

async fn run_sync(ctx: &Context, platform_raw: &str, user_id: Option<String>) -> tide::Result {
    let platform = match parse_platform(platform_raw) {
        Ok(p) => p,
        Err(r) => return Ok(r),
    };
    let user_id = match user_id {
        Some(u) if !u.trim().is_empty() => u,
        _ => return Ok(resp!(status => 400, error => "user_id is required")),
    };
    if !platform.supports_sync() {
        return Ok(resp!(
            status => 400,
            error => format!("analytics sync is not supported for {}", platform)
        ));
    }

    let conn = match sync::find_connection(&ctx.pool, &user_id, platform).await {
        Ok(Some(c)) => c,
        Ok(None) => {
            return Ok(resp!(
                status => 400,
                error => format!(
                    "no active {} connection for this account, connect your account first",
                    platform
                )
            ))
        }
        Err(e) => {
            slog::error!(LOG, "connection lookup failed {}", e);
            return Ok(resp!(status => 500, error => "failed to look up platform connection"));
        }
    };

    let token = match sync::ensure_fresh_token(&ctx.pool, &conn).await {
        Ok(sync::FreshToken::Ready(t)) => t,
        Ok(sync::FreshToken::Reconnect(reason)) => {
            slog::warn!(
                LOG, "refresh failed, reconnect required";
                "user_id" => &conn.user_id,
                "platform" => platform.as_str(),
                "reason" => reason,
            );
            return Ok(resp!(
                status => 400,
                error => format!(
                    "your {} authorization can no longer be refreshed, reconnect your account",
                    platform
                )
            ));
        }
        Err(e) => {
            slog::error!(LOG, "error preparing access token {}", e);
            return Ok(resp!(status => 500, error => "failed to prepare platform credentials"));
        }
    };

    let data = match sync::gather(platform, &token).await {
        Ok(d) => d,
        Err(e) => {
            slog::error!(LOG, "analytics gather failed {}", e);
            return Ok(resp!(status => 500, error => "failed to gather platform analytics"));
        }
    };

    if let Err(e) = sync::record_snapshot(&ctx.pool, &conn, &data).await {
        slog::error!(LOG, "snapshot persistence failed {}", e);
        return Ok(resp!(status => 500, error => "failed to persist analytics snapshot"));
    }

    Ok(resp!(json => serde_json::json!({ "success": true, "data": data })))
}

async fn notify(mut req: tide::Request<Context>) -> tide::Result {
    let body: serde_json::Value = match req.body_json().await {
        Ok(v) => v,
        Err(_) => return Ok(resp!(status => 400, error => "invalid json body")),
    };
    let notification = match mailer::parse_notification(&body) {
        Ok(n) => n,
        Err(problems) => {
            return Ok(resp!(
                status => 400,
                error => format!("invalid notification payload: {}", problems.join(", "))
            ))
        }
    };
    let ctx = req.state();
    match mailer::dispatch(&ctx.pool, &notification).await {
        Ok(email_id) => Ok(resp!(json => serde_json::json!({
            "success": true,
            "emailId": email_id,
        }))),
        Err(e) => {
            slog::error!(LOG, "notification dispatch failed {}", e);
            Ok(tide::Response::builder(500)
                .body(serde_json::json!({ "error": e.to_string(), "success": false }))
                .build())
        }
    }
}

fn parse_platform(raw: &str) -> std::result::Result<Platform, tide::Response> {
    raw.parse::<Platform>()
        .map_err(|_| resp!(status => 400, error => format!("unknown platform {}", raw)))
}

fn unconfigured(platform: Platform, e: crate::Error) -> tide::Response {
    slog::error!(
        LOG, "platform credentials unavailable";
        "platform" => platform.as_str(),
        "err" => e.to_string(),
    );
    resp!(status => 500, error => format!("service is not configured for {}", platform))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_with_platform_error_is_rejected_before_exchange() {
        let params = CallbackParams {
            code: Some("abc".to_string()),
            state: Some("user-1".to_string()),
            error: Some("access_denied".to_string()),
        };
        let err = check_callback(Platform::Spotify, &params).unwrap_err();
        assert!(err.contains("access_denied"));
        assert!(err.contains("spotify"));
    }

    #[test]
    fn callback_missing_code_or_state_is_rejected() {
        for params in [
            CallbackParams::default(),
            CallbackParams {
                code: Some("abc".to_string()),
                ..Default::default()
            },
            CallbackParams {
                state: Some("user-1".to_string()),
                ..Default::default()
            },
            CallbackParams {
                code: Some("".to_string()),
                state: Some("user-1".to_string()),
                ..Default::default()
            },
        ] {
            let err = check_callback(Platform::Youtube, &params).unwrap_err();
            assert_eq!(err, "missing code or state");
        }
    }

    #[test]
    fn callback_with_code_and_state_passes() {
        let params = CallbackParams {
            code: Some("abc".to_string()),
            state: Some("user-1".to_string()),
            error: None,
        };
        let (code, state) = check_callback(Platform::Spotify, &params).unwrap();
        assert_eq!(code, "abc");
        assert_eq!(state, "user-1");
    }

    #[test]
    fn empty_error_param_is_not_an_error() {
        let params = CallbackParams {
            code: Some("abc".to_string()),
            state: Some("user-1".to_string()),
            error: Some("".to_string()),
        };
        assert!(check_callback(Platform::Spotify, &params).is_ok());
    }
}
