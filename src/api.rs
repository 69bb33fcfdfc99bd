//! HTTP routes. Each handler decodes its input, runs one store operation on
//! the blocking pool, and maps the outcome to JSON.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, Path, State, multipart::MultipartRejection,
        rejection::JsonRejection,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::task;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    auth::{AuthUser, TokenSigner, hash_password, verify_login},
    db::{Comment, Database, DbResult, User, Video},
    error::{ApiError, ApiResult},
    media::MediaStore,
    ranking::{FeedOrder, RECOMMENDED_LIMIT},
};

/// Appended to the caption of every duet upload.
pub const DUET_SUFFIX: &str = " (Duet)";

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub tokens: Arc<TokenSigner>,
    pub media: Arc<MediaStore>,
}

impl AppState {
    pub fn new(db: Database, tokens: TokenSigner, media: MediaStore) -> Self {
        Self {
            db,
            tokens: Arc::new(tokens),
            media: Arc::new(media),
        }
    }

    /// Runs a store operation on the blocking pool.
    async fn with_db<F, T>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&Database) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        task::spawn_blocking(move || f(&db))
            .await
            .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
            .map_err(ApiError::from)
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/videos", get(list_videos).post(upload_video))
        .route("/recommended", get(recommended))
        .route("/videos/{id}/like", post(like_video))
        .route(
            "/videos/{id}/comments",
            get(list_comments).post(create_comment),
        )
        .route("/profile/{user_id}", get(profile))
        .route("/duets", post(upload_duet))
        .route("/uploads/{file}", get(serve_upload))
        .fallback(fallback)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub user: User,
    pub videos: Vec<Video>,
}

async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TokenResponse>)> {
    let Json(RegisterRequest {
        email,
        password,
        username,
    }) = payload?;
    let hash = task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
        .map_err(ApiError::internal)?;
    let user = state
        .with_db(move |db| db.create_user(&email, &hash, &username))
        .await?;
    info!(user_id = user.id, "registered user");
    let token = state.tokens.issue(user.id);
    Ok((StatusCode::CREATED, Json(TokenResponse { token })))
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Json<TokenResponse>> {
    let Json(body) = payload?;
    let user_id = state
        .with_db(move |db| {
            let user = db.find_user_by_email(&body.email)?;
            let stored = user.as_ref().map(|user| user.password_hash.as_str());
            let verified = verify_login(&body.password, stored);
            Ok(user.filter(|_| verified).map(|user| user.id))
        })
        .await?
        .ok_or(ApiError::Unauthenticated("invalid email or password"))?;
    Ok(Json(TokenResponse {
        token: state.tokens.issue(user_id),
    }))
}

async fn list_videos(State(state): State<AppState>) -> ApiResult<Json<Vec<Video>>> {
    let videos = state
        .with_db(|db| db.list_videos(FeedOrder::Newest, None))
        .await?;
    Ok(Json(videos))
}

async fn recommended(State(state): State<AppState>) -> ApiResult<Json<Vec<Video>>> {
    let videos = state
        .with_db(|db| db.list_videos(FeedOrder::Recommended, Some(RECOMMENDED_LIMIT)))
        .await?;
    Ok(Json(videos))
}

async fn upload_video(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<Video>)> {
    store_upload(state, user_id, multipart?, "").await
}

async fn upload_duet(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<Video>)> {
    store_upload(state, user_id, multipart?, DUET_SUFFIX).await
}

struct UploadForm {
    file_name: Option<String>,
    bytes: Vec<u8>,
    caption: String,
}

/// Pulls the first file part and the `caption` text part out of the form.
async fn read_upload_form(mut multipart: Multipart) -> ApiResult<UploadForm> {
    let mut file = None;
    let mut caption = String::new();
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("caption") {
            caption = field.text().await?;
        } else if field.file_name().is_some() && file.is_none() {
            let file_name = field.file_name().map(str::to_owned);
            let bytes = field.bytes().await?;
            file = Some((file_name, bytes.to_vec()));
        }
    }
    let (file_name, bytes) = file.ok_or_else(|| ApiError::validation("missing video file"))?;
    Ok(UploadForm {
        file_name,
        bytes,
        caption,
    })
}

async fn store_upload(
    state: AppState,
    user_id: i64,
    multipart: Multipart,
    caption_suffix: &'static str,
) -> ApiResult<(StatusCode, Json<Video>)> {
    let form = read_upload_form(multipart).await?;
    let url = state
        .media
        .save(form.file_name.as_deref(), &form.bytes)
        .await
        .map_err(ApiError::internal)?;
    let caption = format!("{}{caption_suffix}", form.caption);
    let video = state
        .with_db(move |db| db.create_video(user_id, &url, &caption))
        .await?;
    info!(video_id = video.id, user_id, "video uploaded");
    Ok((StatusCode::CREATED, Json(video)))
}

async fn like_video(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Video>> {
    let video_id = parse_id(&id, "video")?;
    let video = state
        .with_db(move |db| db.increment_like(video_id))
        .await?;
    Ok(Json(video))
}

async fn list_comments(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Comment>>> {
    let video_id = parse_id(&id, "video")?;
    let comments = state
        .with_db(move |db| db.list_comments_for_video(video_id))
        .await?;
    Ok(Json(comments))
}

async fn create_comment(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    payload: Result<Json<CommentRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Comment>)> {
    let video_id = parse_id(&id, "video")?;
    let Json(body) = payload?;
    let comment = state
        .with_db(move |db| db.create_comment(video_id, user_id, &body.text))
        .await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProfileResponse>> {
    let user_id = parse_id(&id, "user")?;
    let profile = state
        .with_db(move |db| {
            let Some(user) = db.find_user_by_id(user_id)? else {
                return Ok(None);
            };
            let videos = db.list_videos_by_user(user_id)?;
            Ok(Some(ProfileResponse { user, videos }))
        })
        .await?
        .ok_or_else(|| ApiError::not_found("user not found"))?;
    Ok(Json(profile))
}

async fn serve_upload(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> ApiResult<Response> {
    state.media.stream(&file).await
}

async fn fallback() -> ApiError {
    ApiError::not_found("route not found")
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

/// Ids that are not integers cannot match any row.
fn parse_id(raw: &str, what: &str) -> ApiResult<i64> {
    raw.parse()
        .map_err(|_| ApiError::not_found(format!("{what} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_numeric_ids_are_not_found() {
        assert_eq!(parse_id("12", "video").unwrap(), 12);
        assert!(matches!(
            parse_id("abc", "video").unwrap_err(),
            ApiError::NotFound(message) if message == "video not found"
        ));
    }
}
