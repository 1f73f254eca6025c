//! Shared database mapping utilities
//!
//! PostgreSQL 使用原生 `UUID`/`JSONB`/`TIMESTAMPTZ` 列，SQLite 使用 `TEXT` 存储
//! UUID 与 JSON、`INTEGER` 存储毫秒时间戳。这里集中处理两者的差异。

use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::Row;
use taskgraph_core::{TaskGraphError, TaskGraphResult};
use uuid::Uuid;

/// Helper functions for parsing database fields across different database types
pub struct MappingHelpers;

impl MappingHelpers {
    pub fn parse_json_postgres<T: DeserializeOwned>(
        row: &sqlx::postgres::PgRow,
        field_name: &str,
    ) -> TaskGraphResult<T> {
        let value: sqlx::types::Json<T> = row.try_get(field_name)?;
        Ok(value.0)
    }

    pub fn parse_json_sqlite<T: DeserializeOwned>(
        row: &sqlx::sqlite::SqliteRow,
        field_name: &str,
    ) -> TaskGraphResult<T> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str).map_err(|e| {
            TaskGraphError::Serialization(format!("解析字段 {field_name} 失败: {e}"))
        })
    }

    pub fn parse_optional_json_sqlite<T: DeserializeOwned>(
        row: &sqlx::sqlite::SqliteRow,
        field_name: &str,
    ) -> TaskGraphResult<Option<T>> {
        match row.try_get::<Option<String>, _>(field_name)? {
            Some(json_str) => serde_json::from_str(&json_str).map(Some).map_err(|e| {
                TaskGraphError::Serialization(format!("解析字段 {field_name} 失败: {e}"))
            }),
            None => Ok(None),
        }
    }

    pub fn parse_uuid_sqlite(row: &sqlx::sqlite::SqliteRow, field_name: &str) -> TaskGraphResult<Uuid> {
        let text: String = row.try_get(field_name)?;
        Uuid::parse_str(&text)
            .map_err(|e| TaskGraphError::Serialization(format!("解析UUID {field_name} 失败: {e}")))
    }

    pub fn parse_millis_sqlite(
        row: &sqlx::sqlite::SqliteRow,
        field_name: &str,
    ) -> TaskGraphResult<DateTime<Utc>> {
        let millis: i64 = row.try_get(field_name)?;
        Self::millis_to_datetime(millis)
    }

    pub fn millis_to_datetime(millis: i64) -> TaskGraphResult<DateTime<Utc>> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| TaskGraphError::Serialization(format!("无效的时间戳: {millis}")))
    }

    pub fn to_json_text<T: Serialize + ?Sized>(value: &T) -> TaskGraphResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    pub fn to_optional_json_text<T: Serialize>(value: Option<&T>) -> TaskGraphResult<Option<String>> {
        value.map(Self::to_json_text).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_millis_roundtrip() {
        let now = Utc::now();
        let parsed = MappingHelpers::millis_to_datetime(now.timestamp_millis()).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_empty_dependency_map_is_canonical() {
        let empty: BTreeMap<Uuid, String> = BTreeMap::new();
        assert_eq!(MappingHelpers::to_json_text(&empty).unwrap(), "{}");
        assert_eq!(
            MappingHelpers::to_optional_json_text::<serde_json::Value>(None).unwrap(),
            None
        );
    }
}
