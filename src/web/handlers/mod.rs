pub mod analysis;
pub mod atlas;
pub mod auth;
pub mod datasets;
pub mod mcp;
pub mod system;

#[cfg(test)]
macro_rules! test_app {
    ($ctx:expr) => {
        actix_web::test::init_service(
            actix_web::App::new()
                .app_data(actix_web::web::Data::new($ctx.clone()))
                .configure(crate::web::server::configure),
        )
        .await
    };
}

#[cfg(test)]
pub(crate) use test_app;

/// Insert an unverified user with password `password` and sign a token for it
#[cfg(test)]
pub(crate) async fn seed_user(
    ctx: &crate::core::context::ServiceContext,
    username: &str,
    is_admin: bool,
) -> (crate::db::models::User, String) {
    use crate::db::{models::NewUser, queries};

    let record = NewUser {
        username: username.to_string(),
        email: format!("{}@example.org", username),
        hashed_password: crate::auth::hash_password("password").unwrap(),
        is_admin,
    };
    let user = ctx
        .db
        .call(move |conn| Ok(queries::create_user(conn, &record)?))
        .await
        .unwrap();
    let token = ctx.tokens.issue(&user.username).unwrap();
    (user, token)
}
