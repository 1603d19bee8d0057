//! Registered user: the change-tracked DTO and its inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ExternalId, UserId};
use crate::locale::Locale;
use crate::tracking::ChangeTracker;
use crate::value::FieldMap;

/// Field names, shared with the `users` relation columns.
pub mod fields {
    pub const ID: &str = "id";
    pub const EXTERNAL_ID: &str = "external_id";
    pub const NAME: &str = "name";
    pub const LOCALE: &str = "locale";
    pub const LOCALE_CODE: &str = "locale_code";
    pub const BLOCKED_AT: &str = "blocked_at";
}

/// User as reported by the messaging platform on first contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformUser {
    pub id: ExternalId,
    pub full_name: String,
    pub language_code: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

/// A single field assignment applied through [`UserDto::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum UserChange {
    Name(String),
    Locale(Locale),
    LocaleCode(Option<String>),
    BlockedAt(Option<DateTime<Utc>>),
}

/// Change-tracked projection of a `users` row.
///
/// All writes go through setters so the [`ChangeTracker`] sees them. The
/// identifiers are fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "UserPayload", into = "UserPayload")]
pub struct UserDto {
    id: UserId,
    external_id: ExternalId,
    name: String,
    locale: Locale,
    locale_code: Option<String>,
    blocked_at: Option<DateTime<Utc>>,
    tracker: ChangeTracker,
}

impl UserDto {
    /// Fresh record: every field is assigned, so `state()` and `changes()`
    /// both hold the full field set.
    pub fn new(id: UserId, external_id: ExternalId, name: impl Into<String>, locale: Locale) -> Self {
        let name = name.into();
        let mut tracker = ChangeTracker::new();
        tracker.record(fields::ID, id.get());
        tracker.record(fields::EXTERNAL_ID, external_id.get());
        tracker.record(fields::NAME, name.clone());
        tracker.record(fields::LOCALE, locale.as_str());
        tracker.record(fields::LOCALE_CODE, None::<String>);
        tracker.record(fields::BLOCKED_AT, None::<DateTime<Utc>>);

        Self {
            id,
            external_id,
            name,
            locale,
            locale_code: None,
            blocked_at: None,
            tracker,
        }
    }

    pub fn with_locale_code(mut self, code: Option<String>) -> Self {
        self.set_locale_code(code);
        self
    }

    pub fn with_blocked_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.set_blocked_at(at);
        self
    }

    /// Mark the current values as persisted.
    pub fn loaded(mut self) -> Self {
        self.mark_loaded();
        self
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn external_id(&self) -> ExternalId {
        self.external_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn locale(&self) -> Locale {
        self.locale
    }

    pub fn locale_code(&self) -> Option<&str> {
        self.locale_code.as_deref()
    }

    pub fn blocked_at(&self) -> Option<DateTime<Utc>> {
        self.blocked_at
    }

    /// `true` while the bot can still reach the user.
    pub fn is_reachable(&self) -> bool {
        self.blocked_at.is_none()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.tracker.record(fields::NAME, self.name.clone());
    }

    pub fn set_locale(&mut self, locale: Locale) {
        self.locale = locale;
        self.tracker.record(fields::LOCALE, locale.as_str());
    }

    pub fn set_locale_code(&mut self, code: Option<String>) {
        self.tracker.record(fields::LOCALE_CODE, code.clone());
        self.locale_code = code;
    }

    pub fn set_blocked_at(&mut self, at: Option<DateTime<Utc>>) {
        self.blocked_at = at;
        self.tracker.record(fields::BLOCKED_AT, at);
    }

    pub fn apply(&mut self, change: UserChange) {
        match change {
            UserChange::Name(name) => self.set_name(name),
            UserChange::Locale(locale) => self.set_locale(locale),
            UserChange::LocaleCode(code) => self.set_locale_code(code),
            UserChange::BlockedAt(at) => self.set_blocked_at(at),
        }
    }

    /// Every field ever assigned, including during construction.
    pub fn state(&self) -> &FieldMap {
        self.tracker.state()
    }

    /// Fields assigned since the record was last marked loaded.
    pub fn changes(&self) -> &FieldMap {
        self.tracker.changes()
    }

    pub fn mark_loaded(&mut self) {
        self.tracker.mark_loaded();
    }

    /// Shape checks applied to records decoded from untrusted storage.
    pub fn validate(&self) -> DomainResult<()> {
        if self.id.get() <= 0 {
            return Err(DomainError::validation(format!("user id must be positive, got {}", self.id)));
        }
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("user name must not be empty"));
        }
        Ok(())
    }

    pub fn url(&self) -> String {
        format!("tg://user?id={}", self.external_id)
    }

    /// HTML link to the user, labelled with the escaped display name.
    pub fn mention(&self) -> String {
        format!("<a href=\"{}\">{}</a>", self.url(), escape_html(&self.name))
    }
}

impl PartialEq for UserDto {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.external_id == other.external_id
            && self.name == other.name
            && self.locale == other.locale
            && self.locale_code == other.locale_code
            && self.blocked_at == other.blocked_at
    }
}

/// Wire shape of a cached user: default-valued fields are omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserPayload {
    id: UserId,
    external_id: ExternalId,
    name: String,
    locale: Locale,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    locale_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    blocked_at: Option<DateTime<Utc>>,
}

impl From<UserPayload> for UserDto {
    fn from(payload: UserPayload) -> Self {
        UserDto::new(payload.id, payload.external_id, payload.name, payload.locale)
            .with_locale_code(payload.locale_code)
            .with_blocked_at(payload.blocked_at)
            .loaded()
    }
}

impl From<UserDto> for UserPayload {
    fn from(user: UserDto) -> Self {
        Self {
            id: user.id,
            external_id: user.external_id,
            name: user.name,
            locale: user.locale,
            locale_code: user.locale_code,
            blocked_at: user.blocked_at,
        }
    }
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            other => escaped.push(other),
        }
    }
    escaped
}
