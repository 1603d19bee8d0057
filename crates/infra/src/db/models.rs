//! Relational models.

use chrono::{DateTime, Utc};
use courier_core::user::fields;
use courier_core::{ExternalId, Locale, PlatformUser, UserDto, UserId, Value};

use super::{take, Column, ColumnDef, ColumnKind, Model, Record, TableDef};
use crate::error::DataError;

pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";

const USERS: TableDef = TableDef {
    name: "users",
    columns: &[
        ColumnDef::generated(fields::ID, ColumnKind::BigInt),
        ColumnDef::new(fields::EXTERNAL_ID, ColumnKind::BigInt),
        ColumnDef::new(fields::NAME, ColumnKind::Text),
        ColumnDef::new(fields::LOCALE, ColumnKind::Text),
        ColumnDef::new(fields::LOCALE_CODE, ColumnKind::Text),
        ColumnDef::new(fields::BLOCKED_AT, ColumnKind::Timestamp),
        ColumnDef::generated(CREATED_AT, ColumnKind::Timestamp),
        ColumnDef::generated(UPDATED_AT, ColumnKind::Timestamp),
    ],
    primary_key: fields::ID,
    unique: &[fields::EXTERNAL_ID],
    touched_on_update: Some(UPDATED_AT),
};

/// Row of the `users` relation.
///
/// `id` and the timestamps are `None` until the row has been stored.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Option<UserId>,
    pub external_id: ExternalId,
    pub name: String,
    pub locale: Locale,
    pub locale_code: Option<String>,
    pub blocked_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl User {
    pub const ID: Column<User> = Column::new(fields::ID);
    pub const EXTERNAL_ID: Column<User> = Column::new(fields::EXTERNAL_ID);
    pub const NAME: Column<User> = Column::new(fields::NAME);
    pub const LOCALE: Column<User> = Column::new(fields::LOCALE);
    pub const BLOCKED_AT: Column<User> = Column::new(fields::BLOCKED_AT);

    /// Unsaved row for a user seen for the first time.
    pub fn from_platform(user: &PlatformUser, locale: Locale) -> Self {
        Self {
            id: None,
            external_id: user.id,
            name: user.full_name.clone(),
            locale,
            locale_code: user.language_code.clone(),
            blocked_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Loaded DTO for this row. Fails for rows that were never stored.
    pub fn dto(&self) -> Result<UserDto, DataError> {
        let id = self
            .id
            .ok_or_else(|| DataError::decode("user row has no id; it was never stored"))?;
        Ok(UserDto::new(id, self.external_id, self.name.clone(), self.locale)
            .with_locale_code(self.locale_code.clone())
            .with_blocked_at(self.blocked_at)
            .loaded())
    }
}

impl Model for User {
    const TABLE: &'static TableDef = &USERS;

    fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert(fields::ID, Value::from(self.id.map(|id| id.get())));
        record.insert(fields::EXTERNAL_ID, Value::from(self.external_id.get()));
        record.insert(fields::NAME, Value::from(self.name.as_str()));
        record.insert(fields::LOCALE, Value::from(self.locale.as_str()));
        record.insert(fields::LOCALE_CODE, Value::from(self.locale_code.clone()));
        record.insert(fields::BLOCKED_AT, Value::from(self.blocked_at));
        record.insert(CREATED_AT, Value::from(self.created_at));
        record.insert(UPDATED_AT, Value::from(self.updated_at));
        record
    }

    fn from_record(mut record: Record) -> Result<Self, DataError> {
        let table = Self::TABLE;
        let locale: String = take(&mut record, table, fields::LOCALE)?;
        Ok(Self {
            id: take::<Option<i64>>(&mut record, table, fields::ID)?.map(UserId::new),
            external_id: ExternalId::new(take(&mut record, table, fields::EXTERNAL_ID)?),
            name: take(&mut record, table, fields::NAME)?,
            locale: locale
                .parse()
                .map_err(|e| DataError::decode(format!("users.locale: {}", e)))?,
            locale_code: take(&mut record, table, fields::LOCALE_CODE)?,
            blocked_at: take(&mut record, table, fields::BLOCKED_AT)?,
            created_at: take(&mut record, table, CREATED_AT)?,
            updated_at: take(&mut record, table, UPDATED_AT)?,
        })
    }

    fn primary_key(&self) -> Value {
        Value::from(self.id.map(|id| id.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform_user() -> PlatformUser {
        PlatformUser {
            id: ExternalId::new(111),
            full_name: "A".into(),
            language_code: Some("en-US".into()),
            is_bot: false,
        }
    }

    #[test]
    fn record_round_trip() {
        let mut user = User::from_platform(&platform_user(), Locale::En);
        user.id = Some(UserId::new(1));
        let restored = User::from_record(user.to_record()).unwrap();
        assert_eq!(restored, user);
    }

    #[test]
    fn unsaved_rows_have_no_dto() {
        let user = User::from_platform(&platform_user(), Locale::En);
        assert!(matches!(user.dto(), Err(DataError::Decode(_))));
    }

    #[test]
    fn unknown_locale_fails_decoding() {
        let mut user = User::from_platform(&platform_user(), Locale::En);
        user.id = Some(UserId::new(1));
        let mut record = user.to_record();
        record.insert(fields::LOCALE, Value::from("xx"));
        assert!(matches!(User::from_record(record), Err(DataError::Decode(_))));
    }

    #[test]
    fn dto_is_loaded() {
        let mut user = User::from_platform(&platform_user(), Locale::En);
        user.id = Some(UserId::new(5));
        let dto = user.dto().unwrap();
        assert!(dto.changes().is_empty());
        assert_eq!(dto.locale_code(), Some("en-US"));
    }
}
