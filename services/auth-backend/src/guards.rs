//! Session middleware and route guards
//!
//! `session_layer` runs in front of protected routes. It validates the
//! presented credentials (refreshing transparently when the access token has
//! expired), puts the resulting `AuthContext` into request extensions, and
//! then evaluates the route guards in order. The first rejection wins.
//!
//! Handlers take `Authenticated` explicitly; nothing is read from a global.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::Method;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use session_manager::AuthContext;
use tracing::debug;

use crate::AppState;
use crate::cookies;
use crate::error::ApiError;

/// What a guard gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub context: Option<&'a AuthContext>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    Allow,
    Reject(&'static str),
}

/// A pure access check.
pub type RouteGuard = fn(&RequestView<'_>) -> GuardOutcome;

pub fn require_session(view: &RequestView<'_>) -> GuardOutcome {
    match view.context {
        Some(_) => GuardOutcome::Allow,
        None => GuardOutcome::Reject("no valid session"),
    }
}

/// Guards applied to every protected route, in order.
pub fn default_guards() -> Vec<RouteGuard> {
    vec![require_session]
}

/// Run `guards` in order and stop at the first rejection.
pub fn evaluate(guards: &[RouteGuard], view: &RequestView<'_>) -> GuardOutcome {
    guards
        .iter()
        .map(|guard| guard(view))
        .find(|outcome| *outcome != GuardOutcome::Allow)
        .unwrap_or(GuardOutcome::Allow)
}

pub async fn session_layer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let presented = cookies::read_credentials(request.headers());

    let (context, refreshed) = match state
        .manager
        .authenticate_or_refresh(presented.access.as_deref(), presented.refresh.as_deref())
        .await
    {
        Ok((context, refreshed)) => (Some(context), refreshed),
        Err(_) => (None, None),
    };

    let view = RequestView {
        method: request.method(),
        path: request.uri().path(),
        context: context.as_ref(),
    };
    let response = match evaluate(&state.guards, &view) {
        GuardOutcome::Reject(reason) => {
            debug!(path = view.path, reason, "request rejected by route guard");
            ApiError::Unauthenticated.into_response()
        }
        GuardOutcome::Allow => {
            if let Some(context) = context {
                request.extensions_mut().insert(context);
            }
            next.run(request).await
        }
    };

    // The presented refresh token is consumed by now; its successor must
    // reach the client even when a guard rejected the request.
    match refreshed {
        Some(refreshed) => {
            let jar = cookies::set_session_cookies(
                CookieJar::new(),
                &state.config.cookies,
                refreshed.access_token.clone(),
                refreshed.refresh_credential(),
                state.config.tunables.session_ttl(),
            );
            (jar, response).into_response()
        }
        None => response,
    }
}

/// The caller's validated session. Rejects with 401 when the session layer
/// did not establish one.
#[derive(Debug, Clone)]
pub struct Authenticated(pub AuthContext);

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .map(Authenticated)
            .ok_or(ApiError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> AuthContext {
        AuthContext {
            user_id: "user-1".into(),
            session_handle: "handle-1".into(),
        }
    }

    fn deny_delete(view: &RequestView<'_>) -> GuardOutcome {
        if view.method == Method::DELETE {
            GuardOutcome::Reject("delete not allowed")
        } else {
            GuardOutcome::Allow
        }
    }

    fn deny_all(_: &RequestView<'_>) -> GuardOutcome {
        GuardOutcome::Reject("closed")
    }

    #[test]
    fn require_session_needs_context() {
        let ctx = context();
        let with = RequestView {
            method: &Method::GET,
            path: "/me",
            context: Some(&ctx),
        };
        let without = RequestView {
            context: None,
            ..with
        };
        assert_eq!(require_session(&with), GuardOutcome::Allow);
        assert_eq!(
            require_session(&without),
            GuardOutcome::Reject("no valid session")
        );
    }

    #[test]
    fn first_rejection_wins() {
        let ctx = context();
        let view = RequestView {
            method: &Method::DELETE,
            path: "/me",
            context: Some(&ctx),
        };
        let guards: Vec<RouteGuard> = vec![require_session, deny_delete, deny_all];
        assert_eq!(
            evaluate(&guards, &view),
            GuardOutcome::Reject("delete not allowed")
        );

        let guards: Vec<RouteGuard> = vec![deny_all, deny_delete];
        assert_eq!(evaluate(&guards, &view), GuardOutcome::Reject("closed"));
    }

    #[test]
    fn empty_guard_list_allows() {
        let view = RequestView {
            method: &Method::GET,
            path: "/",
            context: None,
        };
        assert_eq!(evaluate(&[], &view), GuardOutcome::Allow);
    }

    #[tokio::test]
    async fn extractor_rejects_without_context() {
        let (mut parts, _) = axum::http::Request::new(()).into_parts();
        let result = Authenticated::from_request_parts(&mut parts, &()).await;
        assert!(matches!(result, Err(ApiError::Unauthenticated)));

        parts.extensions.insert(context());
        let Authenticated(ctx) = Authenticated::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(ctx.user_id, "user-1");
    }
}
