//! Account registration, credential and Google OAuth login, JWT issuance,
//! and the auth middleware the other route groups layer on.

use std::time::{Duration, SystemTime};

use axum::{
    Json, Router,
    extract::{Extension, Query, Request},
    http::StatusCode,
    middleware::{Next, from_fn},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use josekit::JoseError;
use josekit::{
    Value,
    jws::{HS256, JwsHeader},
    jwt::{self, JwtPayload},
};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope,
    TokenResponse, TokenUrl, basic::BasicClient, reqwest::async_http_client,
};
use scrypt::{
    Scrypt,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::config;
use crate::db;
use crate::error::ApiError;
use crate::model::PublicUser;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Authenticated user, inserted into request extensions by [`require_auth`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub db::User);

/// Like [`CurrentUser`] but for routes where auth is optional.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<db::User>);

#[derive(Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
    name: String,
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct GoogleCallbackQuery {
    code: Option<String>,
    #[allow(dead_code)]
    state: Option<String>,
    error: Option<String>,
}

pub fn routes() -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/me", get(me).layer(from_fn(require_auth)))
        .route("/google", get(google_redirect))
        .route("/google/callback", get(google_callback))
        .route("/logout", post(logout))
}

async fn register(Json(payload): Json<RegisterRequest>) -> Result<Response, ApiError> {
    let email = payload.email.trim().to_lowercase();
    let name = payload.name.trim().to_string();

    if email.is_empty() || payload.password.is_empty() || name.is_empty() {
        return Err(ApiError::bad_request("Email, password and name are required"));
    }

    if db::get_user_by_email(&email)?.is_some() {
        return Err(ApiError::bad_request("Email already registered"));
    }

    let new_user = db::NewUser {
        id: Uuid::new_v4(),
        email,
        password_hash: Some(hash_password(&payload.password)?),
        google_id: None,
        display_name: name,
        avatar_url: None,
    };

    let user = db::create_user(&new_user)?;
    let token = generate_jwt(&user)?;
    tracing::info!("registered user {}", user.id);

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "message": "Registration successful",
            "token": token,
            "user": PublicUser::from(user),
        })),
    )
        .into_response())
}

async fn login(Json(payload): Json<LoginRequest>) -> Result<Response, ApiError> {
    let email = payload.email.trim().to_lowercase();

    let Some(user) = db::get_user_by_email(&email)? else {
        tracing::debug!("login attempt for unknown email");
        return Err(ApiError::unauthorized("Invalid email or password"));
    };

    let Some(hash) = &user.password_hash else {
        // Google-provisioned account with no local password.
        return Err(ApiError::unauthorized("Please login with Google"));
    };

    if !password_equals(hash, &payload.password) {
        tracing::debug!("invalid password for user {}", user.id);
        return Err(ApiError::unauthorized("Invalid email or password"));
    }

    let token = generate_jwt(&user)?;
    tracing::info!("user {} logged in", user.id);

    Ok(Json(serde_json::json!({
        "message": "Login successful",
        "token": token,
        "user": PublicUser::from(user),
    }))
    .into_response())
}

async fn me(Extension(CurrentUser(user)): Extension<CurrentUser>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "user": PublicUser::from(user) }))
}

/// JWTs are stateless; the client discards its copy.
async fn logout() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "Logout successful" }))
}

async fn google_redirect() -> Result<Redirect, ApiError> {
    let Some(client) = oauth_client() else {
        return Err(ApiError::bad_request("Google login is not configured"));
    };

    let (auth_url, _csrf) = client
        .authorize_url(CsrfToken::new_random)
        .add_scope(Scope::new("profile".to_string()))
        .add_scope(Scope::new("email".to_string()))
        .url();

    Ok(Redirect::temporary(auth_url.as_str()))
}

async fn google_callback(Query(query): Query<GoogleCallbackQuery>) -> Redirect {
    let failure = || Redirect::temporary(&format!("{}/login?error=google_failed", config::client_url()));

    if let Some(err) = query.error {
        tracing::warn!("google oauth declined: {}", err);
        return failure();
    }
    let Some(code) = query.code else {
        return failure();
    };

    match google_login(code).await {
        Ok(token) => Redirect::temporary(&format!(
            "{}/auth/callback?token={}",
            config::client_url(),
            token
        )),
        Err(e) => {
            tracing::warn!("google login failed: {}", e);
            failure()
        }
    }
}

/// Exchange the authorization code, fetch the Google profile, and resolve it
/// to a local account: match by google id, link by email, or create.
async fn google_login(code: String) -> Result<String, ApiError> {
    let client = oauth_client().ok_or_else(|| {
        tracing::error!("google callback hit but oauth is not configured");
        ApiError::Internal
    })?;

    let token = client
        .exchange_code(AuthorizationCode::new(code))
        .request_async(async_http_client)
        .await
        .map_err(|e| {
            tracing::warn!("google code exchange failed: {}", e);
            ApiError::unauthorized("Google authentication failed")
        })?;

    let profile: GoogleProfile = reqwest::Client::new()
        .get(GOOGLE_USERINFO_URL)
        .bearer_auth(token.access_token().secret())
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| {
            tracing::warn!("google userinfo fetch failed: {}", e);
            ApiError::unauthorized("Google authentication failed")
        })?
        .json()
        .await
        .map_err(|e| {
            tracing::warn!("google userinfo parse failed: {}", e);
            ApiError::unauthorized("Google authentication failed")
        })?;

    let email = profile.email.trim().to_lowercase();

    let user = if let Some(user) = db::get_user_by_google_id(&profile.id)? {
        user
    } else if let Some(existing) = db::get_user_by_email(&email)? {
        db::link_google_account(existing.id, &profile.id, profile.picture.as_deref())?
    } else {
        let new_user = db::NewUser {
            id: Uuid::new_v4(),
            email,
            password_hash: None,
            google_id: Some(profile.id.clone()),
            display_name: profile.name.unwrap_or_else(|| "Learner".to_string()),
            avatar_url: profile.picture,
        };
        let user = db::create_user(&new_user)?;
        tracing::info!("created user {} via google", user.id);
        user
    };

    generate_jwt(&user)
}

#[derive(Deserialize)]
struct GoogleProfile {
    id: String,
    email: String,
    name: Option<String>,
    picture: Option<String>,
}

fn oauth_client() -> Option<BasicClient> {
    let client_id = config::google_client_id()?;
    let client_secret = config::google_client_secret()?;

    let auth_url = AuthUrl::new(GOOGLE_AUTH_URL.to_string()).ok()?;
    let token_url = TokenUrl::new(GOOGLE_TOKEN_URL.to_string()).ok()?;
    let redirect_url = RedirectUrl::new(config::google_callback_url()).ok()?;

    Some(
        BasicClient::new(
            ClientId::new(client_id),
            Some(ClientSecret::new(client_secret)),
            auth_url,
            Some(token_url),
        )
        .set_redirect_uri(redirect_url),
    )
}

/// Require a valid token; rejects with 401 otherwise.
pub async fn require_auth(mut req: Request, next: Next) -> Result<Response, ApiError> {
    let Some(user) = authenticate_request(&req)? else {
        return Err(ApiError::unauthorized("Authentication required"));
    };
    req.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(req).await)
}

/// Attach the user when a valid token is present, pass through otherwise.
pub async fn optional_auth(mut req: Request, next: Next) -> Result<Response, ApiError> {
    let user = authenticate_request(&req).unwrap_or_else(|e| {
        tracing::error!("auth lookup failed, treating request as anonymous: {}", e);
        None
    });
    req.extensions_mut().insert(MaybeUser(user));
    Ok(next.run(req).await)
}

fn authenticate_request(req: &Request) -> Result<Option<db::User>, ApiError> {
    // Bearer header first, then the session cookie.
    let mut token = None;
    if let Some(auth_header) = req.headers().get("Authorization") {
        if let Ok(auth_value) = auth_header.to_str() {
            if auth_value.starts_with("Bearer ") {
                token = Some(auth_value.trim_start_matches("Bearer ").to_string());
            }
        }
    }

    if token.is_none() {
        let cookie_jar = CookieJar::from_headers(req.headers());
        if let Some(cookie) = cookie_jar.get("session") {
            token = Some(cookie.value().to_string());
        }
    }

    let Some(token) = token else {
        return Ok(None);
    };
    let Some(user_id) = verify_token(&token) else {
        return Ok(None);
    };

    Ok(db::get_user_by_id(user_id)?)
}

pub fn generate_jwt(user: &db::User) -> Result<String, ApiError> {
    generate_jwt_with_expiry(user, config::jwt_expires_in())
}

fn generate_jwt_with_expiry(user: &db::User, expires_in: Duration) -> Result<String, ApiError> {
    let now = SystemTime::now();

    let mut header = JwsHeader::new();
    header.set_token_type("JWT");

    let mut payload = JwtPayload::new();
    payload.set_subject(user.id.to_string());
    payload.set_issued_at(&now);
    payload.set_not_before(&now);
    payload.set_expires_at(&(now + expires_in));
    payload
        .set_claim("email", Some(Value::String(user.email.clone())))
        .map_err(jose_internal)?;
    payload
        .set_claim("name", Some(Value::String(user.display_name.clone())))
        .map_err(jose_internal)?;

    let signer = HS256
        .signer_from_bytes(config::jwt_secret().as_bytes())
        .map_err(jose_internal)?;

    jwt::encode_with_signer(&payload, &header, &signer).map_err(jose_internal)
}

fn jose_internal(err: JoseError) -> ApiError {
    tracing::error!("jwt signing failed: {}", err);
    ApiError::Internal
}

/// Verify a token and return the user id it was issued for.
pub fn verify_token(token: &str) -> Option<Uuid> {
    let now = SystemTime::now();

    match get_payload(token) {
        Ok((payload, _)) => {
            match payload.expires_at() {
                Some(exp) if exp > now => {}
                _ => {
                    tracing::debug!("token rejected: expired or missing expiry");
                    return None;
                }
            }
            if let Some(nbf) = payload.not_before() {
                if nbf > now {
                    tracing::debug!("token rejected: not valid yet");
                    return None;
                }
            }
            let subject = payload.subject()?;
            match Uuid::parse_str(subject) {
                Ok(user_id) => Some(user_id),
                Err(_) => {
                    tracing::debug!("token rejected: malformed subject");
                    None
                }
            }
        }
        Err(_) => {
            // Signature verification failed; salvage the claimed subject for
            // the log even though the token cannot be trusted.
            let claimed = unverified_subject(token).unwrap_or_else(|| "<unknown>".to_string());
            tracing::warn!("token rejected: invalid signature (claimed sub: {})", claimed);
            None
        }
    }
}

fn get_payload(token: &str) -> Result<(JwtPayload, JwsHeader), JoseError> {
    let verifier = HS256.verifier_from_bytes(config::jwt_secret().as_bytes())?;
    jwt::decode_with_verifier(token, &verifier)
}

/// Extract the `sub` claim without verifying anything, for logging only.
/// Tolerates missing padding and outright garbage.
fn unverified_subject(token: &str) -> Option<String> {
    let payload_part = token.split('.').nth(1)?;

    let base64_config = base64::engine::general_purpose::GeneralPurposeConfig::new()
        .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent);
    let engine = base64::engine::GeneralPurpose::new(&base64::alphabet::URL_SAFE, base64_config);

    let decoded = base64::Engine::decode(&engine, payload_part.as_bytes()).ok()?;
    let json: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    json.get("sub")?.as_str().map(|s| s.to_string())
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(OsRng);
    Scrypt
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            tracing::error!("password hashing failed: {}", e);
            ApiError::Internal
        })
}

pub fn password_equals(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Scrypt.verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(e) => {
            tracing::error!("stored password hash is unparseable: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_user() -> db::User {
        db::User {
            id: Uuid::new_v4(),
            email: "ada@example.com".to_string(),
            password_hash: None,
            google_id: None,
            display_name: "Ada".to_string(),
            avatar_url: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn jwt_roundtrip() {
        let user = test_user();
        let token = generate_jwt(&user).unwrap();
        assert_eq!(verify_token(&token), Some(user.id));
    }

    #[test]
    fn expired_jwt_is_rejected() {
        let user = test_user();
        let token = generate_jwt_with_expiry(&user, Duration::ZERO).unwrap();
        assert_eq!(verify_token(&token), None);
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert_eq!(verify_token("not.a.jwt"), None);
        assert_eq!(verify_token(""), None);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let token = generate_jwt(&test_user()).unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push('A');
        assert_eq!(verify_token(&tampered), None);
    }

    #[test]
    fn unverified_subject_survives_bad_signature() {
        let user_id = Uuid::new_v4();
        let claims = serde_json::json!({ "sub": user_id.to_string() }).to_string();
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let fake = format!(
            "eyJhbGciOiJIUzI1NiJ9.{}.bogus",
            base64::Engine::encode(&engine, claims.as_bytes())
        );

        assert_eq!(verify_token(&fake), None);
        assert_eq!(unverified_subject(&fake), Some(user_id.to_string()));
    }

    #[test]
    fn unverified_subject_tolerates_garbage() {
        assert_eq!(unverified_subject("garbage"), None);
        assert_eq!(unverified_subject("a.!!!.c"), None);
    }

    #[test]
    fn password_hash_roundtrip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(password_equals(&hash, "correct horse"));
        assert!(!password_equals(&hash, "wrong horse"));
    }

    #[test]
    fn unparseable_hash_never_matches() {
        assert!(!password_equals("plaintext-not-a-hash", "anything"));
    }
}
