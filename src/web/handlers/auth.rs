use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use log::info;

use crate::auth::{
    email_verification_ttl, generate_random_token, hash_password, password_reset_ttl, token_is_live,
    verify_password, RANDOM_TOKEN_LEN,
};
use crate::core::context::ServiceContext;
use crate::core::error::{ServiceError, ServiceResult};
use crate::db::models::NewUser;
use crate::db::queries;
use crate::web::auth::CurrentUser;
use crate::web::form::read_form;
use crate::web::models::{
    EmailRequest, MessageResponse, RegisterRequest, RegisterResponse, ResetPasswordRequest, TokenRequest,
    TokenResponse,
};

const RESET_REQUESTED: &str = "If that email is registered, a password reset link has been sent.";

async fn hash_blocking(plain: String) -> ServiceResult<String> {
    tokio::task::spawn_blocking(move || hash_password(&plain))
        .await
        .map_err(|e| ServiceError::Internal(format!("hashing task failed: {}", e)))?
        .map_err(ServiceError::from)
}

fn validate_registration(req: &RegisterRequest) -> ServiceResult<()> {
    if req.username.trim().is_empty() {
        return Err(ServiceError::Validation("Username is required".to_string()));
    }
    let email = req.email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => {}
        _ => return Err(ServiceError::Validation("A valid email address is required".to_string())),
    }
    if req.password.is_empty() {
        return Err(ServiceError::Validation("Password is required".to_string()));
    }
    Ok(())
}

/// Create an account and send its verification email
pub async fn register(
    data: web::Data<ServiceContext>,
    body: web::Json<RegisterRequest>,
) -> ServiceResult<HttpResponse> {
    let req = body.into_inner();
    validate_registration(&req)?;
    let username = req.username.trim().to_string();
    let email = req.email.trim().to_string();
    let hashed_password = hash_blocking(req.password).await?;
    let token = generate_random_token(RANDOM_TOKEN_LEN);
    let expires = Utc::now() + email_verification_ttl();

    let record = NewUser {
        username,
        email,
        hashed_password,
        is_admin: false,
    };
    let verification_token = token.clone();
    let user = data
        .db
        .call(move |conn| {
            if queries::get_user_by_username(conn, &record.username)?.is_some() {
                return Err(ServiceError::Validation("Username already registered".to_string()));
            }
            if queries::get_user_by_email(conn, &record.email)?.is_some() {
                return Err(ServiceError::Validation("Email already registered".to_string()));
            }
            let user = queries::create_user(conn, &record)?;
            queries::set_email_verification(conn, user.id, &verification_token, expires)?;
            Ok(user)
        })
        .await?;
    info!("Registered user {}", user.username);

    let sent = data.notifier.send_verification(&user.email, &user.username, &token).await;
    let message = if sent {
        "Registration successful. Please check your email to verify your account."
    } else {
        "Registration successful, but the verification email could not be sent."
    };
    Ok(HttpResponse::Ok().json(RegisterResponse {
        message: message.to_string(),
        user,
    }))
}

/// Exchange form credentials for a bearer token
pub async fn login(
    data: web::Data<ServiceContext>,
    req: HttpRequest,
    payload: web::Payload,
) -> ServiceResult<HttpResponse> {
    let form = read_form(&req, payload, None).await?;
    let username = form.required("username")?;
    let password = form.required("password")?;

    let user = data
        .db
        .call(move |conn| Ok(queries::get_user_by_username(conn, &username)?))
        .await?;
    let user = match user {
        Some(user) if verify_password(&password, &user.hashed_password) => user,
        _ => {
            return Err(ServiceError::Unauthorized(
                "Incorrect username or password".to_string(),
            ))
        }
    };
    if data.settings.require_email_verification && !user.is_email_verified {
        return Err(ServiceError::Forbidden(
            "Please verify your email address first".to_string(),
        ));
    }

    let access_token = data.tokens.issue(&user.username)?;
    Ok(HttpResponse::Ok().json(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
    }))
}

pub async fn read_users_me(user: CurrentUser) -> HttpResponse {
    HttpResponse::Ok().json(user.0)
}

pub async fn verify_email(
    data: web::Data<ServiceContext>,
    body: web::Json<TokenRequest>,
) -> ServiceResult<HttpResponse> {
    let token = body.into_inner().token;
    let now = Utc::now();
    data.db
        .call(move |conn| {
            let user = queries::get_user_by_verification_token(conn, &token)?
                .filter(|user| token_is_live(user.email_verification_expires, now))
                .ok_or_else(|| ServiceError::NotFound("Invalid or expired verification token".to_string()))?;
            queries::mark_email_verified(conn, user.id)?;
            Ok(())
        })
        .await?;
    Ok(HttpResponse::Ok().json(MessageResponse::new("Email verified successfully")))
}

pub async fn resend_verification(
    data: web::Data<ServiceContext>,
    body: web::Json<EmailRequest>,
) -> ServiceResult<HttpResponse> {
    let email = body.into_inner().email.trim().to_string();
    let token = generate_random_token(RANDOM_TOKEN_LEN);
    let expires = Utc::now() + email_verification_ttl();
    let stored_token = token.clone();
    let user = data
        .db
        .call(move |conn| {
            let user = queries::get_user_by_email(conn, &email)?
                .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;
            if user.is_email_verified {
                return Err(ServiceError::Validation("Email is already verified".to_string()));
            }
            queries::set_email_verification(conn, user.id, &stored_token, expires)?;
            Ok(user)
        })
        .await?;

    data.notifier.send_verification(&user.email, &user.username, &token).await;
    Ok(HttpResponse::Ok().json(MessageResponse::new("Verification email sent")))
}

/// Answers 200 whether or not the address is registered
pub async fn forgot_password(
    data: web::Data<ServiceContext>,
    body: web::Json<EmailRequest>,
) -> ServiceResult<HttpResponse> {
    let email = body.into_inner().email.trim().to_string();
    let token = generate_random_token(RANDOM_TOKEN_LEN);
    let expires = Utc::now() + password_reset_ttl();
    let stored_token = token.clone();
    let user = data
        .db
        .call(move |conn| {
            let user = queries::get_user_by_email(conn, &email)?;
            if let Some(user) = &user {
                queries::set_password_reset(conn, user.id, &stored_token, expires)?;
            }
            Ok(user)
        })
        .await?;

    if let Some(user) = user {
        data.notifier.send_password_reset(&user.email, &user.username, &token).await;
    }
    Ok(HttpResponse::Ok().json(MessageResponse::new(RESET_REQUESTED)))
}

pub async fn reset_password(
    data: web::Data<ServiceContext>,
    body: web::Json<ResetPasswordRequest>,
) -> ServiceResult<HttpResponse> {
    let req = body.into_inner();
    if req.new_password.is_empty() {
        return Err(ServiceError::Validation("Password is required".to_string()));
    }
    let token = req.token;
    let now = Utc::now();
    let user = data
        .db
        .call(move |conn| {
            Ok(queries::get_user_by_reset_token(conn, &token)?
                .filter(|user| token_is_live(user.password_reset_expires, now)))
        })
        .await?
        .ok_or_else(|| ServiceError::NotFound("Invalid or expired reset token".to_string()))?;

    let hashed = hash_blocking(req.new_password).await?;
    let user_id = user.id;
    data.db
        .call(move |conn| Ok(queries::update_password(conn, user_id, &hashed)?))
        .await?;
    info!("Password reset for user {}", user.username);
    Ok(HttpResponse::Ok().json(MessageResponse::new("Password has been reset successfully")))
}
