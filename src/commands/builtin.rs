//! Built-in Handlers
//!
//! The handlers shipped with the server and the [`catalog`] that names them.
//!
//! | id               | default command    |
//! |------------------|--------------------|
//! | `system.ping`    | `PING`             |
//! | `user.create`    | `ADD_USER`         |
//! | `user.update`    | `UPDATE_USER`      |
//! | `user.delete`    | `DELETE_USER`      |
//! | `user.view`      | `LOAD_VIEW_USER`   |
//! | `captcha.issue`  | `GET_CAPTCHA`      |
//! | `captcha.verify` | `VERIFY_CAPTCHA`   |
//! | `file.upload`    | `UPLOAD_USER_PIC`  |
//! | `file.view`      | `VIEW_USER_IMAGE`  |
//!
//! User handlers keep their records in the credential cache of the
//! [`SharedStore`](crate::storage::SharedStore):
//! `credentials_id/<id> → username` and `credentials/<username> → JSON`.

use crate::commands::{ConnectionContext, Handler, HandlerCatalog, HandlerError, HandlerRef, Reply};
use crate::protocol::{Outcome, Payload, Request, Value};
use crate::storage::{
    Session, SharedStore, CAPTCHA_ATTRIBUTE, CREDENTIALS_ID_NAMESPACE, CREDENTIALS_NAMESPACE,
};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Namespace holding id counters.
const SEQUENCE_NAMESPACE: &str = "sequences";

/// Counter key for user ids.
const USER_SEQUENCE_KEY: &str = "user_id";

/// Sub-directory of the data directory that holds user pictures.
const USER_FILES_DIR: &str = "user";

/// Captcha answer length.
const CAPTCHA_LENGTH: usize = 6;

/// Letters used for captcha answers. Look-alike characters are left out.
const CAPTCHA_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";

/// Returns a catalog with every built-in handler.
pub fn catalog() -> HandlerCatalog {
    HandlerCatalog::new()
        .with("system.ping", || Arc::new(PingHandler) as HandlerRef)
        .with("user.create", || Arc::new(CreateUserHandler) as HandlerRef)
        .with("user.update", || Arc::new(UpdateUserHandler) as HandlerRef)
        .with("user.delete", || Arc::new(DeleteUserHandler) as HandlerRef)
        .with("user.view", || Arc::new(ViewUserHandler) as HandlerRef)
        .with("captcha.issue", || Arc::new(IssueCaptchaHandler) as HandlerRef)
        .with("captcha.verify", || Arc::new(VerifyCaptchaHandler) as HandlerRef)
        .with("file.upload", || Arc::new(UploadFileHandler) as HandlerRef)
        .with("file.view", || Arc::new(ViewFileHandler) as HandlerRef)
}

// ============================================================================
// Field helpers
// ============================================================================

/// Reads a scalar field as a string. Integers are formatted.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::Integer(n) => Some(n.to_string()),
        other => other
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    }
}

fn optional(request: &Request, key: &str) -> Option<String> {
    request.get_str(key).map(str::to_string)
}

/// Reads a field that may be a single value or a list of values.
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::List(items)) => items.iter().filter_map(scalar).collect(),
        Some(other) => scalar(other).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Reads `userid` for delete: a list, or text such as `3,4` or
/// `userid=3&userid=4`.
fn user_ids(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::List(_)) => string_list(value),
        Some(other) => scalar(other)
            .map(|s| {
                s.replace("userid=", "")
                    .split(['&', ','])
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        None => Vec::new(),
    }
}

fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.trim().as_bytes()))
}

fn parse_birthday(raw: &str, code: &str) -> Result<NaiveDate, HandlerError> {
    NaiveDate::parse_from_str(raw, "%d-%m-%Y").map_err(|_| {
        HandlerError::rejected(code, format!("birthday '{}' is not dd-mm-yyyy", raw))
    })
}

fn parse_user_type(raw: &str, code: &str) -> Result<i64, HandlerError> {
    raw.parse()
        .map_err(|_| HandlerError::rejected(code, format!("usertype '{}' is not a number", raw)))
}

// ============================================================================
// system.ping
// ============================================================================

/// Replies `{pong: <message>}`, or `{pong: "PONG"}` without a message.
#[derive(Debug, Default)]
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn process(
        &self,
        request: &mut Request,
        _session: &mut Session,
        _ctx: &ConnectionContext,
    ) -> Result<Reply, HandlerError> {
        let message = request.get_str("message").unwrap_or("PONG").to_string();
        request.set_outcome(Outcome::success());
        Ok(Reply::data([("pong", message)]))
    }

    fn name(&self) -> &'static str {
        "system.ping"
    }
}

// ============================================================================
// User records
// ============================================================================

/// The credential record cached under `credentials/<username>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: i64,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birthday: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<i64>,
    /// Hex SHA-256 of the password.
    pub password: String,
    #[serde(default)]
    pub appid: Vec<String>,
    pub create_date: DateTime<Utc>,
}

impl UserRecord {
    /// Reads the record for `username`, if cached.
    pub fn load(store: &SharedStore, username: &str) -> Result<Option<Self>, HandlerError> {
        match store.get_str(CREDENTIALS_NAMESPACE, username) {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Reads the record for a user id through `credentials_id`.
    pub fn load_by_id(store: &SharedStore, user_id: &str) -> Result<Option<Self>, HandlerError> {
        match store.get_str(CREDENTIALS_ID_NAMESPACE, user_id) {
            Some(username) => Self::load(store, &username),
            None => Ok(None),
        }
    }

    /// Writes both cache entries.
    fn save(&self, store: &SharedStore) -> Result<(), HandlerError> {
        let json = serde_json::to_string(self)?;
        store.set(CREDENTIALS_ID_NAMESPACE, &self.user_id.to_string(), self.user_name.as_str());
        store.set(CREDENTIALS_NAMESPACE, &self.user_name, json);
        Ok(())
    }

    /// The record as a response map, without the password hash.
    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("user_id".into(), Value::Integer(self.user_id));
        payload.insert("user_name".into(), Value::text(self.user_name.clone()));
        for (key, value) in [
            ("full_name", &self.full_name),
            ("mobile", &self.mobile),
            ("email", &self.email),
        ] {
            if let Some(value) = value {
                payload.insert(key.into(), Value::text(value.clone()));
            }
        }
        if let Some(birthday) = self.birthday {
            payload.insert("birthday".into(), Value::text(birthday.format("%d-%m-%Y").to_string()));
        }
        if let Some(user_type) = self.user_type {
            payload.insert("user_type".into(), Value::Integer(user_type));
        }
        payload.insert(
            "appid".into(),
            Value::List(self.appid.iter().cloned().map(Value::Text).collect()),
        );
        payload.insert("create_date".into(), Value::text(self.create_date.to_rfc3339()));
        payload
    }
}

// ============================================================================
// user.create
// ============================================================================

/// Creates a user in the credential cache.
///
/// Requires `username` and `password`. Optional: `fullname`, `mobile`,
/// `email`, `birthday` (dd-mm-yyyy), `usertype`, `appid` (one or a list).
/// The plaintext password is removed from the request so it never reaches
/// the journal.
#[derive(Debug, Default)]
pub struct CreateUserHandler;

#[async_trait]
impl Handler for CreateUserHandler {
    async fn process(
        &self,
        request: &mut Request,
        _session: &mut Session,
        ctx: &ConnectionContext,
    ) -> Result<Reply, HandlerError> {
        let password = request.remove("password");
        let password = password.as_ref().and_then(scalar);

        let username = optional(request, "username")
            .ok_or_else(|| HandlerError::rejected("createuser_01", "username is required"))?;
        let password =
            password.ok_or_else(|| HandlerError::rejected("createuser_02", "password is required"))?;

        let birthday = optional(request, "birthday")
            .map(|raw| parse_birthday(&raw, "createuser_03"))
            .transpose()?;
        let user_type = optional(request, "usertype")
            .map(|raw| parse_user_type(&raw, "createuser_03"))
            .transpose()?;

        let user_id = ctx.store.incr_by(SEQUENCE_NAMESPACE, USER_SEQUENCE_KEY, 1)?;
        let record = UserRecord {
            user_id,
            user_name: username.clone(),
            full_name: optional(request, "fullname"),
            mobile: optional(request, "mobile"),
            email: optional(request, "email"),
            birthday,
            user_type,
            password: hash_password(&password),
            appid: string_list(request.get("appid")),
            create_date: Utc::now(),
        };

        // Claim the username first so two concurrent creates cannot both win.
        let json = serde_json::to_string(&record)?;
        if !ctx.store.set_nx(CREDENTIALS_NAMESPACE, &username, json) {
            return Err(HandlerError::rejected(
                "createuser_04",
                format!("user '{}' already exists", username),
            ));
        }
        ctx.store
            .set(CREDENTIALS_ID_NAMESPACE, &user_id.to_string(), username.as_str());

        request.insert("user_id", Value::Integer(user_id));
        request.set_outcome(Outcome::success());
        info!(user_id, username = %username, client = %ctx.peer, "User created");
        Ok(Reply::empty())
    }

    fn name(&self) -> &'static str {
        "user.create"
    }
}

// ============================================================================
// user.update
// ============================================================================

/// Updates an existing user identified by `userid`.
///
/// Only the fields present in the request change. A blank `password` keeps
/// the current one. Renaming moves the `credentials` entry.
#[derive(Debug, Default)]
pub struct UpdateUserHandler;

#[async_trait]
impl Handler for UpdateUserHandler {
    async fn process(
        &self,
        request: &mut Request,
        _session: &mut Session,
        ctx: &ConnectionContext,
    ) -> Result<Reply, HandlerError> {
        let password = request.remove("password");
        let password = password.as_ref().and_then(scalar);

        let user_id = request
            .get("userid")
            .and_then(scalar)
            .ok_or_else(|| HandlerError::rejected("updateuser_01", "userid is required"))?;
        let mut record = UserRecord::load_by_id(&ctx.store, &user_id)?.ok_or_else(|| {
            HandlerError::rejected("updateuser_02", format!("user {} not found", user_id))
        })?;
        let old_name = record.user_name.clone();

        if let Some(raw) = optional(request, "birthday") {
            record.birthday = Some(parse_birthday(&raw, "updateuser_03")?);
        }
        if let Some(raw) = optional(request, "usertype") {
            record.user_type = Some(parse_user_type(&raw, "updateuser_03")?);
        }
        if let Some(full_name) = optional(request, "fullname") {
            record.full_name = Some(full_name);
        }
        if let Some(mobile) = optional(request, "mobile") {
            record.mobile = Some(mobile);
        }
        if let Some(email) = optional(request, "email") {
            record.email = Some(email);
        }
        if let Some(password) = password {
            record.password = hash_password(&password);
        }
        if request.get("appid").is_some() {
            record.appid = string_list(request.get("appid"));
        }

        if let Some(new_name) = optional(request, "username").filter(|n| *n != old_name) {
            let json = serde_json::to_string(&UserRecord {
                user_name: new_name.clone(),
                ..record.clone()
            })?;
            if !ctx.store.set_nx(CREDENTIALS_NAMESPACE, &new_name, json) {
                return Err(HandlerError::rejected(
                    "createuser_04",
                    format!("user '{}' already exists", new_name),
                ));
            }
            ctx.store.delete(CREDENTIALS_NAMESPACE, &old_name);
            record.user_name = new_name;
        }

        record.save(&ctx.store)?;
        request.set_outcome(Outcome::success());
        debug!(user_id = record.user_id, client = %ctx.peer, "User updated");
        Ok(Reply::empty())
    }

    fn name(&self) -> &'static str {
        "user.update"
    }
}

// ============================================================================
// user.delete
// ============================================================================

/// Deletes the users listed in `userid` from both cache namespaces.
#[derive(Debug, Default)]
pub struct DeleteUserHandler;

#[async_trait]
impl Handler for DeleteUserHandler {
    async fn process(
        &self,
        request: &mut Request,
        _session: &mut Session,
        ctx: &ConnectionContext,
    ) -> Result<Reply, HandlerError> {
        let ids = user_ids(request.get("userid"));
        if ids.is_empty() {
            return Err(HandlerError::rejected("deleteuser_01", "userid is required"));
        }

        let mut deleted = 0i64;
        for id in &ids {
            let username = ctx.store.get_str(CREDENTIALS_ID_NAMESPACE, id);
            if ctx.store.delete(CREDENTIALS_ID_NAMESPACE, id) {
                deleted += 1;
            }
            if let Some(username) = username {
                ctx.store.delete(CREDENTIALS_NAMESPACE, &username);
            }
        }

        request.set_outcome(Outcome::success());
        debug!(requested = ids.len(), deleted, client = %ctx.peer, "Users deleted");
        Ok(Reply::data([("deleted", Value::Integer(deleted))]))
    }

    fn name(&self) -> &'static str {
        "user.delete"
    }
}

// ============================================================================
// user.view
// ============================================================================

/// Returns the cached record for `userid`, without the password hash.
#[derive(Debug, Default)]
pub struct ViewUserHandler;

#[async_trait]
impl Handler for ViewUserHandler {
    async fn process(
        &self,
        request: &mut Request,
        _session: &mut Session,
        ctx: &ConnectionContext,
    ) -> Result<Reply, HandlerError> {
        let user_id = request
            .get("userid")
            .and_then(scalar)
            .ok_or_else(|| HandlerError::rejected("viewuser_01", "userid is required"))?;
        let record = UserRecord::load_by_id(&ctx.store, &user_id)?.ok_or_else(|| {
            HandlerError::rejected("viewuser_02", format!("user {} not found", user_id))
        })?;

        request.set_outcome(Outcome::success());
        Ok(Reply::Data(record.to_payload()))
    }

    fn name(&self) -> &'static str {
        "user.view"
    }
}

// ============================================================================
// captcha.issue / captcha.verify
// ============================================================================

/// A fresh answer plus the challenge shown to the user.
///
/// The challenge spells the answer in random case with separators. Rendering
/// it as an image is left to the client.
fn new_captcha() -> (String, String) {
    let mut rng = rand::thread_rng();
    let answer: String = (0..CAPTCHA_LENGTH)
        .map(|_| CAPTCHA_ALPHABET[rng.gen_range(0..CAPTCHA_ALPHABET.len())] as char)
        .collect();
    let challenge = answer
        .chars()
        .map(|c| {
            if rng.gen_bool(0.5) {
                c.to_ascii_uppercase().to_string()
            } else {
                c.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    (answer, challenge)
}

/// Stores a new captcha answer in the session and returns `{data: challenge}`.
#[derive(Debug, Default)]
pub struct IssueCaptchaHandler;

#[async_trait]
impl Handler for IssueCaptchaHandler {
    async fn process(
        &self,
        request: &mut Request,
        session: &mut Session,
        _ctx: &ConnectionContext,
    ) -> Result<Reply, HandlerError> {
        let (answer, challenge) = new_captcha();
        session.set_attribute(CAPTCHA_ATTRIBUTE, answer);
        request.set_outcome(Outcome::success());
        Ok(Reply::data([("data", challenge)]))
    }

    fn name(&self) -> &'static str {
        "captcha.issue"
    }
}

/// Checks `answer` against the session's captcha. The stored answer is
/// cleared whether or not it matches.
#[derive(Debug, Default)]
pub struct VerifyCaptchaHandler;

#[async_trait]
impl Handler for VerifyCaptchaHandler {
    async fn process(
        &self,
        request: &mut Request,
        session: &mut Session,
        _ctx: &ConnectionContext,
    ) -> Result<Reply, HandlerError> {
        let expected = session
            .remove_attribute(CAPTCHA_ATTRIBUTE)
            .and_then(|value| value.as_str().map(str::to_string))
            .ok_or_else(|| HandlerError::rejected("captcha_01", "no captcha was issued"))?;

        let answer: String = request
            .get_str("answer")
            .unwrap_or_default()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        if !answer.eq_ignore_ascii_case(&expected) {
            return Err(HandlerError::rejected("captcha_02", "captcha does not match"));
        }

        request.set_outcome(Outcome::success());
        Ok(Reply::data([("verified", "true")]))
    }

    fn name(&self) -> &'static str {
        "captcha.verify"
    }
}

// ============================================================================
// file.upload / file.view
// ============================================================================

/// `<data_dir>/user/YYYY/M/D` for a given local time.
fn user_dir(data_dir: &Path, at: &DateTime<Local>) -> PathBuf {
    data_dir
        .join(USER_FILES_DIR)
        .join(at.year().to_string())
        .join(at.month().to_string())
        .join(at.day().to_string())
}

/// The extension of `name` including the dot, limited to ASCII alphanumerics.
fn extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Stores the `file` blob as `<millis>_<random hex><ext>` under today's
/// directory and replies `{localFileName, serverFileName}`.
#[derive(Debug, Default)]
pub struct UploadFileHandler;

#[async_trait]
impl Handler for UploadFileHandler {
    async fn process(
        &self,
        request: &mut Request,
        _session: &mut Session,
        ctx: &ConnectionContext,
    ) -> Result<Reply, HandlerError> {
        let Some(Value::Blob(data)) = request.get("file").cloned() else {
            request.set_outcome(Outcome::success());
            return Ok(Reply::empty());
        };
        let local_name = optional(request, "filename").unwrap_or_default();

        let now = Local::now();
        let token: u128 = rand::random();
        let server_name = format!(
            "{}_{:032x}{}",
            now.timestamp_millis(),
            token,
            extension(&local_name)
        );

        let dir = user_dir(&ctx.files.data_dir, &now);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&server_name), &data).await?;

        request.insert("serverFileName", server_name.as_str());
        request.set_outcome(Outcome::success());
        debug!(file = %server_name, size = data.len(), client = %ctx.peer, "File uploaded");
        Ok(Reply::data([
            ("localFileName", local_name),
            ("serverFileName", server_name),
        ]))
    }

    fn name(&self) -> &'static str {
        "file.upload"
    }
}

/// Streams the file named by `filename` as a raw response, falling back to
/// the configured placeholder image.
#[derive(Debug, Default)]
pub struct ViewFileHandler;

impl ViewFileHandler {
    /// Where an uploaded file with this server name lives.
    fn locate(data_dir: &Path, file_name: &str) -> PathBuf {
        let uploaded_at = file_name
            .split_once('_')
            .and_then(|(millis, _)| millis.parse::<i64>().ok())
            .and_then(|millis| Local.timestamp_millis_opt(millis).single());

        match uploaded_at {
            Some(at) => user_dir(data_dir, &at).join(file_name),
            None => data_dir.join(USER_FILES_DIR).join(file_name),
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

#[async_trait]
impl Handler for ViewFileHandler {
    async fn process(
        &self,
        request: &mut Request,
        _session: &mut Session,
        ctx: &ConnectionContext,
    ) -> Result<Reply, HandlerError> {
        let file_name = optional(request, "filename")
            .ok_or_else(|| HandlerError::rejected("viewimage_01", "filename is required"))?;
        if file_name.contains(['/', '\\']) || file_name.contains("..") {
            return Err(HandlerError::rejected(
                "viewimage_01",
                format!("invalid filename '{}'", file_name),
            ));
        }

        let path = Self::locate(&ctx.files.data_dir, &file_name);
        if is_file(&path).await {
            request.set_outcome(Outcome::success());
            return Ok(Reply::File(path));
        }

        if let Some(placeholder) = &ctx.files.placeholder_image {
            if is_file(placeholder).await {
                request.set_outcome(Outcome::success());
                return Ok(Reply::File(placeholder.clone()));
            }
        }

        Err(HandlerError::rejected(
            "viewimage_02",
            format!("image '{}' not found", file_name),
        ))
    }

    fn name(&self) -> &'static str {
        "file.view"
    }
}
