use actix_web::dev::Payload;
use actix_web::http::header;
use actix_web::{web, FromRequest, HttpRequest};
use futures::future::LocalBoxFuture;

use crate::core::access::Principal;
use crate::core::context::ServiceContext;
use crate::core::error::{ServiceError, ServiceResult};
use crate::db::models::User;
use crate::db::queries;

fn credentials_error() -> ServiceError {
    ServiceError::Unauthorized("Could not validate credentials".to_string())
}

/// Token from an `Authorization: Bearer ...` header
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return None;
    }
    Some(token.trim().to_string())
}

/// Resolve a session token to its user
pub async fn authenticate(ctx: &ServiceContext, token: &str) -> ServiceResult<User> {
    let claims = ctx.tokens.verify(token)?;
    let username = claims.sub;
    ctx.db
        .call(move |conn| Ok(queries::get_user_by_username(conn, &username)?))
        .await?
        .ok_or_else(credentials_error)
}

fn context(req: &HttpRequest) -> ServiceResult<web::Data<ServiceContext>> {
    req.app_data::<web::Data<ServiceContext>>()
        .cloned()
        .ok_or_else(|| ServiceError::Internal("service context is not registered".to_string()))
}

/// The authenticated caller; rejects the request with 401 otherwise
pub struct CurrentUser(pub User);

impl FromRequest for CurrentUser {
    type Error = ServiceError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let ctx = context(req);
        let token = bearer_token(req);
        Box::pin(async move {
            let ctx = ctx?;
            let token = token.ok_or_else(credentials_error)?;
            authenticate(&ctx, &token).await.map(CurrentUser)
        })
    }
}

/// The caller if a token was sent. A token that does not verify is still a 401.
pub struct MaybeUser(pub Option<User>);

impl MaybeUser {
    pub fn principal(&self) -> Principal {
        match &self.0 {
            Some(user) => Principal::User(user.clone()),
            None => Principal::System,
        }
    }
}

impl FromRequest for MaybeUser {
    type Error = ServiceError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let ctx = context(req);
        let token = bearer_token(req);
        Box::pin(async move {
            let Some(token) = token else {
                return Ok(MaybeUser(None));
            };
            let ctx = ctx?;
            authenticate(&ctx, &token).await.map(|user| MaybeUser(Some(user)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_bearer_token_parsing() {
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Bearer abc.def"))
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("abc.def"));

        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "bearer   xyz"))
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("xyz"));

        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Basic dXNlcjpwdw=="))
            .to_http_request();
        assert_eq!(bearer_token(&req), None);
        assert_eq!(bearer_token(&TestRequest::default().to_http_request()), None);
    }
}
