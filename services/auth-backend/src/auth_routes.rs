//! `/auth/*` handlers: sign-in redirect, provider callback, refresh, sign-out

use axum::Json;
use axum::extract::{Form, Path, Query, State};
use axum::http::header::{LOCATION, USER_AGENT};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use serde_json::json;
use session::SessionMetadata;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::cookies;
use crate::error::ApiError;
use crate::guards::Authenticated;

/// Parameters a provider sends back, as query string or form body.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// `GET /auth/signinup/{provider}`: 302 to the provider's consent screen.
pub async fn sign_in_up(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    jar: CookieJar,
) -> Result<Response, ApiError> {
    let initiated = state.manager.initiate_sign_in(&provider).await?;
    debug!(provider = %provider, "redirecting to provider");
    let jar = cookies::set_state_cookie(
        jar,
        &state.config.cookies,
        initiated.state,
        state.config.tunables.state_ttl(),
    );
    Ok((
        StatusCode::FOUND,
        jar,
        [(LOCATION, initiated.authorization_url)],
    )
        .into_response())
}

pub async fn callback_get(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Result<Response, ApiError> {
    complete_callback(state, provider, headers, jar, params).await
}

pub async fn callback_post(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
    Form(params): Form<CallbackParams>,
) -> Result<Response, ApiError> {
    complete_callback(state, provider, headers, jar, params).await
}

fn request_metadata(headers: &HeaderMap) -> SessionMetadata {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    SessionMetadata {
        user_agent: header(USER_AGENT.as_str()),
        ip: header("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_owned()))
            .filter(|ip| !ip.is_empty()),
    }
}

async fn complete_callback(
    state: AppState,
    provider: String,
    headers: HeaderMap,
    jar: CookieJar,
    params: CallbackParams,
) -> Result<Response, ApiError> {
    if let Some(error) = params.error {
        let detail = params.error_description.unwrap_or_default();
        info!(provider = %provider, error = %error, "provider reported sign-in failure");
        return Err(ApiError::General(format!(
            "provider returned error: {error} {detail}"
        )
        .trim_end()
        .to_string()));
    }
    let (Some(code), Some(oauth_state)) = (params.code, params.state) else {
        return Err(ApiError::Field("code and state are required".into()));
    };
    if !cookies::state_matches(&jar, &oauth_state) {
        warn!(provider = %provider, "callback state not bound to this browser");
        return Err(ApiError::General(
            "sign-in was not started from this browser".into(),
        ));
    }
    let jar = cookies::clear_state_cookie(jar, &state.config.cookies);

    let signed_in = match state
        .manager
        .complete_sign_in(&provider, &code, &oauth_state, request_metadata(&headers))
        .await
    {
        Ok(signed_in) => signed_in,
        Err(e) => return Ok((jar, ApiError::from(e)).into_response()),
    };

    let jar = cookies::set_session_cookies(
        jar,
        &state.config.cookies,
        signed_in.access_token.clone(),
        signed_in.refresh_credential(),
        state.config.tunables.session_ttl(),
    );
    let body = json!({
        "status": "OK",
        "user": {
            "id": signed_in.user.user_id,
            "email": signed_in.email,
        },
        "createdNewUser": signed_in.created_new_user,
    });
    Ok((jar, Json(body)).into_response())
}

/// `POST /auth/session/refresh`: rotate the refresh cookie.
pub async fn refresh(State(state): State<AppState>, jar: CookieJar) -> Response {
    let Some(presented) = jar.get(cookies::REFRESH_COOKIE).map(|c| c.value().to_owned()) else {
        return ApiError::Unauthenticated.into_response();
    };

    match state.manager.refresh(&presented).await {
        Ok(refreshed) => {
            let jar = cookies::set_session_cookies(
                jar,
                &state.config.cookies,
                refreshed.access_token.clone(),
                refreshed.refresh_credential(),
                state.config.tunables.session_ttl(),
            );
            (jar, Json(json!({ "status": "OK" }))).into_response()
        }
        Err(e) => {
            let jar = cookies::clear_session_cookies(jar, &state.config.cookies);
            (jar, ApiError::from(e)).into_response()
        }
    }
}

/// `POST /auth/signout`: revoke the caller's session and clear its cookies.
pub async fn sign_out(
    State(state): State<AppState>,
    Authenticated(context): Authenticated,
    jar: CookieJar,
) -> Response {
    state.manager.sign_out(&context.session_handle).await;
    let jar = cookies::clear_session_cookies(jar, &state.config.cookies);
    (jar, Json(json!({ "status": "OK" }))).into_response()
}
