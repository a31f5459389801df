//! Relational persistence: a small `Database` contract with named-parameter
//! queries and single-level transactions, its SQLite implementation, and the
//! template stores built on top of it.

use crate::error::{EngineError, Result};
use crate::schema::{StatementCategory, StatementTemplate, ValidationRule, ValueAdjustment};
use log::debug;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS statement_template (
      template_code TEXT PRIMARY KEY,
      version INTEGER NOT NULL DEFAULT 1,
      description TEXT,
      parent_code TEXT,
      validation_rules TEXT NOT NULL DEFAULT '[]'
    );

    CREATE TABLE IF NOT EXISTS template_line_item (
      template_code TEXT NOT NULL REFERENCES statement_template(template_code),
      position INTEGER NOT NULL,
      code TEXT NOT NULL,
      display_name TEXT,
      formula TEXT,
      base_value_source TEXT,
      category TEXT NOT NULL DEFAULT 'OTHER',
      carry_forward INTEGER,
      adjustments TEXT NOT NULL DEFAULT '[]',
      PRIMARY KEY (template_code, code)
    );

    CREATE INDEX IF NOT EXISTS idx_line_item_template ON template_line_item(template_code, position);

    CREATE TABLE IF NOT EXISTS scenario_driver (
      entity_id TEXT NOT NULL,
      scenario_id INTEGER NOT NULL,
      period_id INTEGER NOT NULL,
      driver_code TEXT NOT NULL,
      value REAL NOT NULL,
      unit_code TEXT,
      PRIMARY KEY (entity_id, scenario_id, period_id, driver_code)
    );

    CREATE TABLE IF NOT EXISTS fx_rate (
      from_currency TEXT NOT NULL,
      to_currency TEXT NOT NULL,
      period_id INTEGER NOT NULL,
      rate_type TEXT NOT NULL DEFAULT 'average',
      rate REAL NOT NULL,
      PRIMARY KEY (from_currency, to_currency, period_id, rate_type)
    );

    CREATE TABLE IF NOT EXISTS scenario_action (
      scenario_id INTEGER NOT NULL,
      action_code TEXT NOT NULL,
      name TEXT,
      trigger_type TEXT NOT NULL,
      start_period INTEGER NOT NULL DEFAULT 1,
      end_period INTEGER,
      trigger_condition TEXT,
      trigger_sticky INTEGER NOT NULL DEFAULT 0,
      transformations TEXT NOT NULL DEFAULT '[]',
      PRIMARY KEY (scenario_id, action_code)
    );
"#;

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Integer(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Integer(value as i64)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Integer(value as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Real(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ParamValue::Null)
    }
}

impl From<&ParamValue> for SqlValue {
    fn from(value: &ParamValue) -> Self {
        match value {
            ParamValue::Null => SqlValue::Null,
            ParamValue::Integer(v) => SqlValue::Integer(*v),
            ParamValue::Real(v) => SqlValue::Real(*v),
            ParamValue::Text(v) => SqlValue::Text(v.clone()),
        }
    }
}

/// Named statement parameters. Names are stored without the leading `:`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<ParamValue>) {
        let name = name.trim_start_matches([':', '@', '$']);
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name.trim_start_matches([':', '@', '$']))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ColumnRef<'a> {
    Name(&'a str),
    Index(usize),
}

impl<'a> From<&'a str> for ColumnRef<'a> {
    fn from(name: &'a str) -> Self {
        ColumnRef::Name(name)
    }
}

impl From<usize> for ColumnRef<'_> {
    fn from(index: usize) -> Self {
        ColumnRef::Index(index)
    }
}

/// Materialized query result with a forward-only cursor.
///
/// The cursor starts before the first row; call [`ResultSet::next`] until it
/// returns `false`.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    cursor: Option<usize>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self {
            columns,
            rows,
            cursor: None,
        }
    }

    pub fn next(&mut self) -> bool {
        let next = self.cursor.map_or(0, |c| c + 1);
        if next < self.rows.len() {
            self.cursor = Some(next);
            true
        } else {
            self.cursor = Some(self.rows.len());
            false
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.is_some_and(|c| c >= self.rows.len())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.columns.get(index).map(String::as_str)
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| EngineError::NotFound(format!("column '{}'", name)))
    }

    fn cell<'c>(&self, column: impl Into<ColumnRef<'c>>) -> Result<&SqlValue> {
        let row = self
            .cursor
            .and_then(|c| self.rows.get(c))
            .ok_or_else(|| EngineError::Storage("result set has no current row".to_string()))?;
        let index = match column.into() {
            ColumnRef::Name(name) => self.column_index(name)?,
            ColumnRef::Index(index) => index,
        };
        row.get(index)
            .ok_or_else(|| EngineError::NotFound(format!("column index {}", index)))
    }

    pub fn is_null<'c>(&self, column: impl Into<ColumnRef<'c>>) -> Result<bool> {
        Ok(matches!(self.cell(column)?, SqlValue::Null))
    }

    pub fn get_f64<'c>(&self, column: impl Into<ColumnRef<'c>>) -> Result<f64> {
        match self.cell(column)? {
            SqlValue::Real(v) => Ok(*v),
            SqlValue::Integer(v) => Ok(*v as f64),
            SqlValue::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| EngineError::Storage(format!("'{}' is not a number", s))),
            other => Err(type_error("REAL", other)),
        }
    }

    pub fn get_opt_f64<'c>(&self, column: impl Into<ColumnRef<'c>>) -> Result<Option<f64>> {
        let column = column.into();
        if self.is_null(column)? {
            return Ok(None);
        }
        self.get_f64(column).map(Some)
    }

    pub fn get_i64<'c>(&self, column: impl Into<ColumnRef<'c>>) -> Result<i64> {
        match self.cell(column)? {
            SqlValue::Integer(v) => Ok(*v),
            other => Err(type_error("INTEGER", other)),
        }
    }

    pub fn get_i32<'c>(&self, column: impl Into<ColumnRef<'c>>) -> Result<i32> {
        let value = self.get_i64(column)?;
        i32::try_from(value)
            .map_err(|_| EngineError::Storage(format!("{} does not fit in a 32-bit integer", value)))
    }

    pub fn get_opt_i32<'c>(&self, column: impl Into<ColumnRef<'c>>) -> Result<Option<i32>> {
        let column = column.into();
        if self.is_null(column)? {
            return Ok(None);
        }
        self.get_i32(column).map(Some)
    }

    pub fn get_string<'c>(&self, column: impl Into<ColumnRef<'c>>) -> Result<String> {
        match self.cell(column)? {
            SqlValue::Text(s) => Ok(s.clone()),
            SqlValue::Integer(v) => Ok(v.to_string()),
            SqlValue::Real(v) => Ok(v.to_string()),
            other => Err(type_error("TEXT", other)),
        }
    }

    pub fn get_opt_string<'c>(&self, column: impl Into<ColumnRef<'c>>) -> Result<Option<String>> {
        let column = column.into();
        if self.is_null(column)? {
            return Ok(None);
        }
        self.get_string(column).map(Some)
    }
}

fn type_error(expected: &str, found: &SqlValue) -> EngineError {
    EngineError::Storage(format!("expected {} value, found {:?}", expected, found.data_type()))
}

/// Persistence collaborator consumed by the engine.
///
/// Statements use `:name` placeholders. A placeholder with no matching entry
/// in [`Params`] binds as NULL. Transactions are single-level.
pub trait Database: Send + Sync {
    fn execute_query(&self, sql: &str, params: &Params) -> Result<ResultSet>;
    fn execute_update(&self, sql: &str, params: &Params) -> Result<usize>;
    fn last_insert_id(&self) -> Result<i64>;
    fn begin_transaction(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
    fn in_transaction(&self) -> bool;
}

struct SqliteState {
    conn: Connection,
    in_transaction: bool,
}

#[derive(Clone)]
pub struct SqliteDatabase {
    state: Arc<Mutex<SqliteState>>,
}

impl std::fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDatabase").finish_non_exhaustive()
    }
}

impl SqliteDatabase {
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            state: Arc::new(Mutex::new(SqliteState {
                conn,
                in_transaction: false,
            })),
        })
    }

    /// Creates the template, driver, FX and action tables if they are missing.
    pub fn init_schema(&self) -> Result<()> {
        let state = self.lock()?;
        state.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, SqliteState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::Storage("sqlite connection mutex poisoned".to_string()))
    }

    fn prepare_bound<'c>(
        conn: &'c Connection,
        sql: &str,
        params: &Params,
    ) -> Result<rusqlite::Statement<'c>> {
        let mut stmt = conn.prepare(sql)?;
        for index in 1..=stmt.parameter_count() {
            let value = stmt
                .parameter_name(index)
                .and_then(|name| params.get(name))
                .map(SqlValue::from)
                .unwrap_or(SqlValue::Null);
            stmt.raw_bind_parameter(index, value)?;
        }
        Ok(stmt)
    }
}

impl Database for SqliteDatabase {
    fn execute_query(&self, sql: &str, params: &Params) -> Result<ResultSet> {
        let state = self.lock()?;
        let mut stmt = Self::prepare_bound(&state.conn, sql, params)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();

        let mut rows = Vec::new();
        let mut cursor = stmt.raw_query();
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(row.get::<_, SqlValue>(i)?);
            }
            rows.push(values);
        }

        Ok(ResultSet::new(columns, rows))
    }

    fn execute_update(&self, sql: &str, params: &Params) -> Result<usize> {
        let state = self.lock()?;
        let mut stmt = Self::prepare_bound(&state.conn, sql, params)?;
        Ok(stmt.raw_execute()?)
    }

    fn last_insert_id(&self) -> Result<i64> {
        Ok(self.lock()?.conn.last_insert_rowid())
    }

    fn begin_transaction(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.in_transaction {
            return Err(EngineError::TransactionState(
                "a transaction is already open".to_string(),
            ));
        }
        state.conn.execute_batch("BEGIN TRANSACTION")?;
        state.in_transaction = true;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.lock()?;
        if !state.in_transaction {
            return Err(EngineError::TransactionState(
                "commit without an open transaction".to_string(),
            ));
        }
        state.conn.execute_batch("COMMIT")?;
        state.in_transaction = false;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut state = self.lock()?;
        if !state.in_transaction {
            return Err(EngineError::TransactionState(
                "rollback without an open transaction".to_string(),
            ));
        }
        state.conn.execute_batch("ROLLBACK")?;
        state.in_transaction = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.lock().map(|state| state.in_transaction).unwrap_or(false)
    }
}

/// Runs `work` inside a transaction, rolling back if it fails.
pub fn with_transaction<T>(db: &dyn Database, work: impl FnOnce() -> Result<T>) -> Result<T> {
    db.begin_transaction()?;
    match work() {
        Ok(value) => {
            db.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = db.rollback() {
                debug!("Rollback after failure also failed: {}", rollback_err);
            }
            Err(e)
        }
    }
}

/// Writes (or replaces) one driver row.
pub fn upsert_driver(
    db: &dyn Database,
    entity_id: &str,
    scenario_id: i32,
    period_id: i32,
    driver_code: &str,
    value: f64,
    unit_code: Option<&str>,
) -> Result<()> {
    db.execute_update(
        "INSERT OR REPLACE INTO scenario_driver (entity_id, scenario_id, period_id, driver_code, value, unit_code)
         VALUES (:entity_id, :scenario_id, :period_id, :driver_code, :value, :unit_code)",
        &Params::new()
            .with("entity_id", entity_id)
            .with("scenario_id", scenario_id)
            .with("period_id", period_id)
            .with("driver_code", driver_code)
            .with("value", value)
            .with("unit_code", unit_code),
    )?;
    Ok(())
}

pub trait TemplateStore: Send + Sync {
    /// Fails with `NotFound` when no template has this code.
    fn load(&self, code: &str) -> Result<StatementTemplate>;
    /// Inserts or fully replaces the template with the same code.
    fn save(&self, template: &StatementTemplate) -> Result<()>;
    fn exists(&self, code: &str) -> Result<bool>;
    fn list_codes(&self) -> Result<Vec<String>>;
}

impl<T: TemplateStore + ?Sized> TemplateStore for Arc<T> {
    fn load(&self, code: &str) -> Result<StatementTemplate> {
        (**self).load(code)
    }

    fn save(&self, template: &StatementTemplate) -> Result<()> {
        (**self).save(template)
    }

    fn exists(&self, code: &str) -> Result<bool> {
        (**self).exists(code)
    }

    fn list_codes(&self) -> Result<Vec<String>> {
        (**self).list_codes()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTemplateStore {
    templates: RwLock<BTreeMap<String, StatementTemplate>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(self, template: StatementTemplate) -> Self {
        if let Ok(mut templates) = self.templates.write() {
            templates.insert(template.code.clone(), template);
        }
        self
    }
}

fn poisoned() -> EngineError {
    EngineError::Storage("template store lock poisoned".to_string())
}

impl TemplateStore for InMemoryTemplateStore {
    fn load(&self, code: &str) -> Result<StatementTemplate> {
        self.templates
            .read()
            .map_err(|_| poisoned())?
            .get(code)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("template '{}'", code)))
    }

    fn save(&self, template: &StatementTemplate) -> Result<()> {
        template.validate()?;
        self.templates
            .write()
            .map_err(|_| poisoned())?
            .insert(template.code.clone(), template.clone());
        Ok(())
    }

    fn exists(&self, code: &str) -> Result<bool> {
        Ok(self.templates.read().map_err(|_| poisoned())?.contains_key(code))
    }

    fn list_codes(&self) -> Result<Vec<String>> {
        Ok(self
            .templates
            .read()
            .map_err(|_| poisoned())?
            .keys()
            .cloned()
            .collect())
    }
}

/// Template store backed by the `statement_template` and
/// `template_line_item` tables.
pub struct SqlTemplateStore<D: Database> {
    db: Arc<D>,
}

impl<D: Database> SqlTemplateStore<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<D> {
        &self.db
    }

    fn write_template(&self, template: &StatementTemplate) -> Result<()> {
        let rules = serde_json::to_string(&template.validation_rules)?;
        let code = template.code.as_str();

        self.db.execute_update(
            "DELETE FROM template_line_item WHERE template_code = :code",
            &Params::new().with("code", code),
        )?;
        self.db.execute_update(
            "INSERT OR REPLACE INTO statement_template (template_code, version, description, parent_code, validation_rules)
             VALUES (:code, :version, :description, :parent_code, :rules)",
            &Params::new()
                .with("code", code)
                .with("version", template.version as i64)
                .with("description", template.description.clone())
                .with("parent_code", template.parent_code.clone())
                .with("rules", rules),
        )?;

        for (position, item) in template.line_items.iter().enumerate() {
            self.db.execute_update(
                "INSERT INTO template_line_item
                   (template_code, position, code, display_name, formula, base_value_source, category, carry_forward, adjustments)
                 VALUES (:template_code, :position, :code, :display_name, :formula, :source, :category, :carry_forward, :adjustments)",
                &Params::new()
                    .with("template_code", code)
                    .with("position", position as i64)
                    .with("code", item.code.as_str())
                    .with("display_name", item.display_name.clone())
                    .with("formula", item.formula.clone())
                    .with("source", item.base_value_source.clone())
                    .with("category", item.category.as_str())
                    .with("carry_forward", item.carry_forward)
                    .with("adjustments", serde_json::to_string(&item.adjustments)?),
            )?;
        }
        Ok(())
    }
}

impl<D: Database> TemplateStore for SqlTemplateStore<D> {
    fn load(&self, code: &str) -> Result<StatementTemplate> {
        let mut header = self.db.execute_query(
            "SELECT version, description, parent_code, validation_rules FROM statement_template WHERE template_code = :code",
            &Params::new().with("code", code),
        )?;
        if !header.next() {
            return Err(EngineError::NotFound(format!("template '{}'", code)));
        }

        let mut template = StatementTemplate::new(code);
        let version = header.get_i64("version")?;
        template.version = u32::try_from(version).map_err(|_| {
            EngineError::Storage(format!("template '{}' has invalid version {}", code, version))
        })?;
        template.description = header.get_opt_string("description")?;
        template.parent_code = header.get_opt_string("parent_code")?;
        let rules: Vec<ValidationRule> = serde_json::from_str(&header.get_string("validation_rules")?)?;
        template.validation_rules = rules;

        let mut rows = self.db.execute_query(
            "SELECT code, display_name, formula, base_value_source, category, carry_forward, adjustments
             FROM template_line_item WHERE template_code = :code ORDER BY position",
            &Params::new().with("code", code),
        )?;
        while rows.next() {
            let category_text = rows.get_string("category")?;
            let category = StatementCategory::parse(&category_text).ok_or_else(|| {
                EngineError::Storage(format!("unknown statement category '{}'", category_text))
            })?;
            let adjustments: Vec<ValueAdjustment> =
                serde_json::from_str(&rows.get_string("adjustments")?)?;

            template.line_items.push(crate::schema::LineItemDefinition {
                code: rows.get_string("code")?,
                display_name: rows.get_opt_string("display_name")?,
                formula: rows.get_opt_string("formula")?,
                base_value_source: rows.get_opt_string("base_value_source")?,
                category,
                carry_forward: rows.get_opt_i32("carry_forward")?.map(|v| v != 0),
                adjustments,
            });
        }

        debug!(
            "Loaded template '{}' with {} line items",
            code,
            template.line_items.len()
        );
        Ok(template)
    }

    fn save(&self, template: &StatementTemplate) -> Result<()> {
        template.validate()?;
        with_transaction(self.db.as_ref(), || self.write_template(template))
    }

    fn exists(&self, code: &str) -> Result<bool> {
        let mut rows = self.db.execute_query(
            "SELECT 1 FROM statement_template WHERE template_code = :code",
            &Params::new().with("code", code),
        )?;
        Ok(rows.next())
    }

    fn list_codes(&self) -> Result<Vec<String>> {
        let mut rows = self.db.execute_query(
            "SELECT template_code FROM statement_template ORDER BY template_code",
            &Params::new(),
        )?;
        let mut codes = Vec::new();
        while rows.next() {
            codes.push(rows.get_string(0usize)?);
        }
        Ok(codes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::schema::LineItemDefinition;

    fn test_db() -> SqliteDatabase {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.init_schema().unwrap();
        db
    }

    #[test]
    fn test_named_params_and_null_binding() {
        let db = test_db();
        upsert_driver(&db, "E1", 1, 1, "REVENUE", 1000.0, Some("USD")).unwrap();

        // :unit_code is never bound, so it becomes NULL.
        db.execute_update(
            "INSERT INTO scenario_driver (entity_id, scenario_id, period_id, driver_code, value, unit_code)
             VALUES (:entity_id, 1, 2, 'REVENUE', :value, :unit_code)",
            &Params::new().with("entity_id", "E1").with("value", 1100.0),
        )
        .unwrap();

        let mut rows = db
            .execute_query(
                "SELECT period_id, value, unit_code FROM scenario_driver WHERE entity_id = :e ORDER BY period_id",
                &Params::new().with(":e", "E1"),
            )
            .unwrap();
        assert_eq!(rows.column_count(), 3);
        assert_eq!(rows.column_index("VALUE").unwrap(), 1);

        assert!(rows.next());
        assert_eq!(rows.get_i32("period_id").unwrap(), 1);
        assert_eq!(rows.get_string("unit_code").unwrap(), "USD");

        assert!(rows.next());
        assert!((rows.get_f64(1usize).unwrap() - 1100.0).abs() < 0.01);
        assert!(rows.is_null("unit_code").unwrap());
        assert!(rows.get_opt_string("unit_code").unwrap().is_none());

        assert!(!rows.next());
        assert!(rows.is_exhausted());
        assert_eq!(
            rows.get_f64("value").unwrap_err().kind(),
            ErrorKind::Storage
        );
    }

    #[test]
    fn test_unknown_column_is_not_found() {
        let db = test_db();
        let mut rows = db.execute_query("SELECT 1 AS one", &Params::new()).unwrap();
        assert!(rows.next());
        assert_eq!(rows.get_i64("missing").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_nested_transaction_fails() {
        let db = test_db();
        db.begin_transaction().unwrap();
        let err = db.begin_transaction().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionState);
        db.rollback().unwrap();
        assert!(db.commit().is_err());
        assert!(!db.in_transaction());
    }

    #[test]
    fn test_rollback_discards_changes() {
        let db = test_db();
        db.begin_transaction().unwrap();
        upsert_driver(&db, "E1", 1, 1, "OPEX", 5.0, None).unwrap();
        db.rollback().unwrap();

        let mut rows = db
            .execute_query("SELECT COUNT(*) FROM scenario_driver", &Params::new())
            .unwrap();
        assert!(rows.next());
        assert_eq!(rows.get_i64(0usize).unwrap(), 0);
    }

    #[test]
    fn test_sql_template_store_round_trip_and_overwrite() {
        let db = Arc::new(test_db());
        let store = SqlTemplateStore::new(db.clone());

        let template = StatementTemplate::new("T1")
            .with_line_item(LineItemDefinition::driver("REVENUE", StatementCategory::ProfitAndLoss))
            .with_line_item(
                LineItemDefinition::computed("CASH", "CASH[t-1] + REVENUE", StatementCategory::BalanceSheet)
                    .with_carry_forward(true),
            );

        store.save(&template).unwrap();
        store.save(&template).unwrap();

        assert_eq!(store.list_codes().unwrap(), vec!["T1"]);
        let loaded = store.load("T1").unwrap();
        assert_eq!(loaded, template);

        let mut rows = db
            .execute_query(
                "SELECT COUNT(*) FROM template_line_item WHERE template_code = 'T1'",
                &Params::new(),
            )
            .unwrap();
        assert!(rows.next());
        assert_eq!(rows.get_i64(0usize).unwrap(), 2);

        assert!(!store.exists("NOPE").unwrap());
        assert_eq!(store.load("NOPE").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_corrupt_template_version_is_an_error() {
        let db = Arc::new(test_db());
        let store = SqlTemplateStore::new(db.clone());
        store
            .save(&StatementTemplate::new("T1").with_line_item(LineItemDefinition::driver(
                "REVENUE",
                StatementCategory::ProfitAndLoss,
            )))
            .unwrap();

        db.execute_update(
            "UPDATE statement_template SET version = -1 WHERE template_code = :code",
            &Params::new().with("code", "T1"),
        )
        .unwrap();

        let err = store.load("T1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.to_string().contains("-1"));
    }
}
