//! The editable settings form.
//!
//! Holds the current schema, configuration and validation errors. A write is
//! staged with `prepare_edit`, validated remotely against the hypothetical
//! configuration, and only then committed. Every staged edit gets a token; a
//! validation response is committed only if its token is still the latest
//! one issued, so a slow reply can never overwrite a newer edit.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::api::SimulationApi;
use crate::error::{Error, Result};
use crate::path_value;
use crate::schema::{FieldDescriptor, FormEntry, LeafType, Schema, expand};
use crate::validation::{ValidationError, ValidationIndex};

pub const DEFAULT_CONFIG_NAME: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOption {
    pub value: String,
    pub label: String,
}

impl ConfigOption {
    pub fn from_name(name: &str) -> Self {
        Self {
            value: name.to_string(),
            label: display_label(name),
        }
    }
}

pub fn display_label(name: &str) -> String {
    name.replace('_', " ")
}

pub fn storage_key(label: &str) -> String {
    label.trim().replace(' ', "_")
}

pub fn options_from_names(names: &[String]) -> Vec<ConfigOption> {
    names.iter().map(|n| ConfigOption::from_name(n)).collect()
}

static SAVE_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9 _-]+$").ok());

fn check_save_name(name: &str) -> Result<String> {
    let re = SAVE_NAME
        .as_ref()
        .ok_or_else(|| Error::msg("invalid config name pattern"))?;
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::msg("config name must not be empty"));
    }
    if !re.is_match(trimmed) {
        return Err(Error::msg(format!(
            "config name '{trimmed}' may only contain letters, digits, spaces, '_' and '-'"
        )));
    }
    Ok(storage_key(trimmed))
}

/// Why an input was dropped before any remote call. Never shown as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectedInput {
    NotANumber,
    Negative,
    NotABoolean,
}

impl std::fmt::Display for RejectedInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RejectedInput::NotANumber => "not a number",
            RejectedInput::Negative => "negative value for an unsigned field",
            RejectedInput::NotABoolean => "expected true or false",
        })
    }
}

pub fn coerce(raw: &str, leaf: LeafType) -> std::result::Result<Value, RejectedInput> {
    let s = raw.trim();
    match leaf {
        LeafType::Text => Ok(Value::String(raw.to_string())),
        LeafType::Boolean => match s.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(RejectedInput::NotABoolean),
        },
        LeafType::Float if s.is_empty() => Ok(Value::from(0.0)),
        LeafType::Integer | LeafType::UnsignedInteger if s.is_empty() => Ok(Value::from(0)),
        LeafType::Float => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or(RejectedInput::NotANumber),
        LeafType::Integer => s
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| RejectedInput::NotANumber),
        LeafType::UnsignedInteger => {
            let n = s.parse::<i128>().map_err(|_| RejectedInput::NotANumber)?;
            if n < 0 {
                return Err(RejectedInput::Negative);
            }
            u64::try_from(n)
                .map(Value::from)
                .map_err(|_| RejectedInput::NotANumber)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingEdit {
    token: u64,
    pub path: String,
    pub value: Value,
    /// Configuration as it would be after this write.
    pub config: Arc<Value>,
}

impl PendingEdit {
    pub fn token(&self) -> u64 {
        self.token
    }
}

#[derive(Debug, Clone)]
pub enum Prepared {
    Ready(PendingEdit),
    Rejected(RejectedInput),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Committed,
    Rejected(RejectedInput),
    /// A newer edit was issued while this one was being validated.
    Superseded,
}

/// What observers receive after each committed change.
#[derive(Debug, Clone)]
pub struct FormSnapshot {
    pub config: Arc<Value>,
    pub errors: Arc<Vec<ValidationError>>,
}

pub type FormObserver = Box<dyn Fn(&FormSnapshot) + Send>;

/// Result of fetching a configuration, not yet applied to a form.
#[derive(Debug, Clone)]
pub struct LoadedForm {
    pub schema: Option<Value>,
    pub config: Value,
    pub names: Option<Vec<String>>,
    pub selected: String,
}

impl LoadedForm {
    pub fn fetch_default(api: &dyn SimulationApi) -> Result<Self> {
        let config = api.default_config()?;
        let schema = api.form_schema()?;
        let names = api.list_configs()?;
        Ok(Self {
            schema: Some(schema),
            config,
            names: Some(names),
            selected: DEFAULT_CONFIG_NAME.into(),
        })
    }

    pub fn fetch_named(api: &dyn SimulationApi, name: &str) -> Result<Self> {
        let config = api.get_config(name)?;
        Ok(Self {
            schema: None,
            config,
            names: None,
            selected: name.to_string(),
        })
    }
}

pub struct FormModel {
    schema: Arc<Schema>,
    entries: Arc<Vec<FormEntry>>,
    config: Arc<Value>,
    errors: Arc<Vec<ValidationError>>,
    index: ValidationIndex,
    options: Vec<ConfigOption>,
    selected: Option<ConfigOption>,
    option_name: String,
    issued: u64,
    pending_base: Option<Arc<Value>>,
    observer: Option<FormObserver>,
}

impl std::fmt::Debug for FormModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormModel")
            .field("fields", &self.entries.len())
            .field("errors", &self.errors.len())
            .field("selected", &self.selected)
            .field("issued", &self.issued)
            .finish()
    }
}

impl FormModel {
    pub fn new(schema: &Value, config: Value) -> Result<Self> {
        let schema = Schema::from_json(schema)?;
        let entries = expand(&schema)?;
        Ok(Self {
            schema: Arc::new(schema),
            entries: Arc::new(entries),
            config: Arc::new(config),
            errors: Arc::new(Vec::new()),
            index: ValidationIndex::default(),
            options: Vec::new(),
            selected: None,
            option_name: String::new(),
            issued: 0,
            pending_base: None,
            observer: None,
        })
    }

    pub fn from_loaded(loaded: LoadedForm) -> Result<Self> {
        let Some(schema) = loaded.schema.as_ref() else {
            return Err(Error::msg("cannot build a form without a schema"));
        };
        let mut form = Self::new(schema, Value::Null)?;
        form.apply_loaded(loaded)?;
        Ok(form)
    }

    pub fn load_default(&mut self, api: &dyn SimulationApi) -> Result<()> {
        let loaded = LoadedForm::fetch_default(api)?;
        self.apply_loaded(loaded)
    }

    pub fn load_named(&mut self, api: &dyn SimulationApi, name: &str) -> Result<()> {
        let loaded = LoadedForm::fetch_named(api, name)?;
        self.apply_loaded(loaded)
    }

    /// Replace schema/config/options wholesale. In-flight edits are voided.
    pub fn apply_loaded(&mut self, loaded: LoadedForm) -> Result<()> {
        if let Some(schema) = loaded.schema.as_ref() {
            let schema = Schema::from_json(schema)?;
            let entries = expand(&schema)?;
            self.schema = Arc::new(schema);
            self.entries = Arc::new(entries);
        }
        if let Some(names) = loaded.names.as_ref() {
            self.options = options_from_names(names);
        }
        self.selected = Some(
            self.options
                .iter()
                .find(|o| o.value == loaded.selected)
                .cloned()
                .unwrap_or_else(|| ConfigOption::from_name(&loaded.selected)),
        );
        self.option_name = display_label(&loaded.selected);
        self.config = Arc::new(loaded.config);
        self.errors = Arc::new(Vec::new());
        self.index = ValidationIndex::default();
        self.issued += 1;
        self.pending_base = None;
        info!(config = %loaded.selected, fields = self.fields().count(), "form loaded");
        Ok(())
    }

    pub fn on_change(&mut self, observer: FormObserver) {
        self.observer = Some(observer);
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn entries(&self) -> &[FormEntry] {
        &self.entries
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.entries.iter().filter_map(FormEntry::as_field)
    }

    pub fn field(&self, path: &str) -> Option<&FieldDescriptor> {
        let path = path_value::normalize(path);
        self.fields().find(|f| f.path == path)
    }

    pub fn config(&self) -> Arc<Value> {
        Arc::clone(&self.config)
    }

    pub fn errors(&self) -> Arc<Vec<ValidationError>> {
        Arc::clone(&self.errors)
    }

    pub fn snapshot(&self) -> FormSnapshot {
        FormSnapshot {
            config: self.config(),
            errors: self.errors(),
        }
    }

    pub fn value(&self, path: &str) -> Option<&Value> {
        path_value::get(&self.config, path)
    }

    pub fn display_value(&self, path: &str) -> String {
        match self.value(path) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
        }
    }

    pub fn errors_for(&self, path: &str) -> &[String] {
        self.index.for_path(path)
    }

    /// Error paths no field claims (e.g. whole-config rules).
    pub fn unclaimed_errors(&self) -> Vec<(&str, &[String])> {
        let known: Vec<&str> = self.fields().map(|f| f.path.as_str()).collect();
        self.index
            .unclaimed(&known)
            .into_iter()
            .map(|p| (p, self.index.for_path(p)))
            .collect()
    }

    pub fn options(&self) -> &[ConfigOption] {
        &self.options
    }

    pub fn selected(&self) -> Option<&ConfigOption> {
        self.selected.as_ref()
    }

    pub fn option_name(&self) -> &str {
        &self.option_name
    }

    pub fn set_option_name(&mut self, name: impl Into<String>) {
        self.option_name = name.into();
    }

    /// Coerce and guard `raw`, then stage the write. Local rejections come
    /// back as `Prepared::Rejected`; an unknown path or a leaf type that
    /// disagrees with the schema is a contract violation.
    pub fn prepare_edit(&mut self, path: &str, raw: &str, leaf: LeafType) -> Result<Prepared> {
        let Some(field) = self.field(path) else {
            return Err(Error::msg(format!("no form field at path '{path}'")));
        };
        if field.leaf != leaf {
            return Err(Error::msg(format!(
                "field '{}' is {}, not {leaf}",
                field.path, field.leaf
            )));
        }
        let path = field.path.clone();

        let value = match coerce(raw, leaf) {
            Ok(v) => v,
            Err(why) => {
                debug!(%path, ?why, "input rejected");
                return Ok(Prepared::Rejected(why));
            }
        };
        if !leaf.accepts(&value) {
            return Err(Error::msg(format!(
                "value {value} does not fit field '{path}' ({leaf})"
            )));
        }

        let base = self
            .pending_base
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.config));
        let hypothetical = Arc::new(path_value::set(&base, &path, value.clone())?);
        self.issued += 1;
        self.pending_base = Some(Arc::clone(&hypothetical));
        debug!(%path, token = self.issued, "edit staged");
        Ok(Prepared::Ready(PendingEdit {
            token: self.issued,
            path,
            value,
            config: hypothetical,
        }))
    }

    /// Commit a validated edit with the validator's errors (full replacement).
    pub fn commit_edit(&mut self, edit: PendingEdit, errors: Vec<ValidationError>) -> EditOutcome {
        if edit.token != self.issued {
            debug!(path = %edit.path, token = edit.token, latest = self.issued, "dropping superseded validation");
            return EditOutcome::Superseded;
        }
        self.config = edit.config;
        self.index = ValidationIndex::index(&errors);
        self.errors = Arc::new(errors);
        self.pending_base = None;
        debug!(path = %edit.path, errors = self.errors.len(), "edit committed");
        if let Some(observer) = self.observer.as_ref() {
            observer(&self.snapshot());
        }
        EditOutcome::Committed
    }

    /// Forget a staged edit whose validation failed outright.
    pub fn abandon_edit(&mut self, edit: &PendingEdit) {
        if edit.token == self.issued {
            self.pending_base = None;
        }
    }

    pub fn set_field(
        &mut self,
        api: &dyn SimulationApi,
        path: &str,
        raw: &str,
        leaf: LeafType,
    ) -> Result<EditOutcome> {
        let edit = match self.prepare_edit(path, raw, leaf)? {
            Prepared::Ready(edit) => edit,
            Prepared::Rejected(why) => return Ok(EditOutcome::Rejected(why)),
        };
        match api.validate(&edit.config) {
            Ok(errors) => Ok(self.commit_edit(edit, errors)),
            Err(e) => {
                self.abandon_edit(&edit);
                Err(e)
            }
        }
    }

    /// `set_field` with the leaf type taken from the schema.
    pub fn set_path(&mut self, api: &dyn SimulationApi, path: &str, raw: &str) -> Result<EditOutcome> {
        let leaf = self
            .field(path)
            .map(|f| f.leaf)
            .ok_or_else(|| Error::msg(format!("no form field at path '{path}'")))?;
        self.set_field(api, path, raw, leaf)
    }

    /// Storage key and the configuration to persist under it.
    pub fn prepare_save(&self, name: &str) -> Result<(String, Arc<Value>)> {
        Ok((check_save_name(name)?, self.config()))
    }

    /// Persist, then re-list names. Does not touch the form.
    pub fn persist(api: &dyn SimulationApi, key: &str, config: &Value) -> Result<Vec<String>> {
        api.save_config(key, config)?;
        api.list_configs()
    }

    pub fn apply_saved(&mut self, key: &str, names: &[String]) {
        self.options = options_from_names(names);
        let selected = self
            .options
            .iter()
            .find(|o| o.value == key)
            .cloned()
            .unwrap_or_else(|| ConfigOption::from_name(key));
        self.option_name = selected.label.clone();
        self.selected = Some(selected);
        info!(config = %key, "configuration saved");
    }

    pub fn save(&mut self, api: &dyn SimulationApi, name: &str) -> Result<()> {
        let (key, config) = self.prepare_save(name)?;
        let names = Self::persist(api, &key, &config)?;
        self.apply_saved(&key, &names);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn form() -> FormModel {
        FormModel::new(
            &json!({
                "Traits": {
                    "Label": "Traits",
                    "Type": "object",
                    "Fields": {
                        "StopLoss": {"Label": "Stop Loss", "Type": "float"},
                        "Periods": {"Label": "Periods", "Type": "unsigned_integer"}
                    }
                }
            }),
            json!({"Traits": {"StopLoss": 2.5, "Periods": 3}}),
        )
        .unwrap()
    }

    fn ready(p: Prepared) -> PendingEdit {
        match p {
            Prepared::Ready(e) => e,
            Prepared::Rejected(r) => panic!("unexpected rejection {r:?}"),
        }
    }

    #[test]
    fn coerce_rules() {
        assert_eq!(coerce("", LeafType::Float), Ok(json!(0.0)));
        assert_eq!(coerce(" ", LeafType::Integer), Ok(json!(0)));
        assert_eq!(coerce("1.25", LeafType::Float), Ok(json!(1.25)));
        assert_eq!(coerce("abc", LeafType::Float), Err(RejectedInput::NotANumber));
        assert_eq!(coerce("NaN", LeafType::Float), Err(RejectedInput::NotANumber));
        assert_eq!(coerce("1.5", LeafType::Integer), Err(RejectedInput::NotANumber));
        assert_eq!(coerce("-1", LeafType::UnsignedInteger), Err(RejectedInput::Negative));
        assert_eq!(coerce("-1", LeafType::Integer), Ok(json!(-1)));
        assert_eq!(
            coerce("18446744073709551615", LeafType::UnsignedInteger),
            Ok(json!(u64::MAX))
        );
        assert_eq!(
            coerce("18446744073709551616", LeafType::UnsignedInteger),
            Err(RejectedInput::NotANumber)
        );
        assert_eq!(
            coerce("-18446744073709551616", LeafType::UnsignedInteger),
            Err(RejectedInput::Negative)
        );
        assert_eq!(coerce(" x ", LeafType::Text), Ok(json!(" x ")));
        assert_eq!(coerce("TRUE", LeafType::Boolean), Ok(json!(true)));
        assert_eq!(coerce("yes", LeafType::Boolean), Err(RejectedInput::NotABoolean));
    }

    #[test]
    fn labels_and_keys_round_trip() {
        assert_eq!(display_label("My_Config"), "My Config");
        assert_eq!(storage_key("My Config"), "My_Config");
        assert_eq!(storage_key(&display_label("a_b_c")), "a_b_c");
    }

    #[test]
    fn save_name_guard() {
        assert_eq!(check_save_name("  My Config ").unwrap(), "My_Config");
        assert!(check_save_name("   ").is_err());
        assert!(check_save_name("../etc").is_err());
        assert_eq!(check_save_name("run-2_b").unwrap(), "run-2_b");
    }

    #[test]
    fn unknown_path_and_type_mismatch_are_errors() {
        let mut f = form();
        assert!(f.prepare_edit("Traits.Nope", "1", LeafType::Float).is_err());
        assert!(f.prepare_edit("Traits.StopLoss", "1", LeafType::Integer).is_err());
    }

    #[test]
    fn newer_edit_wins_over_late_response() {
        let mut f = form();
        let first = ready(f.prepare_edit("Traits.StopLoss", "4", LeafType::Float).unwrap());
        let second = ready(f.prepare_edit("Traits.Periods", "7", LeafType::UnsignedInteger).unwrap());

        // The second edit builds on the first one's staged config.
        assert_eq!(
            *second.config,
            json!({"Traits": {"StopLoss": 4.0, "Periods": 7}})
        );

        assert_eq!(f.commit_edit(second, vec![]), EditOutcome::Committed);
        assert_eq!(
            f.commit_edit(first, vec![ValidationError::new("Traits.StopLoss", "late")]),
            EditOutcome::Superseded
        );
        assert_eq!(f.value("Traits.StopLoss"), Some(&json!(4.0)));
        assert!(f.errors_for("Traits.StopLoss").is_empty());
    }

    #[test]
    fn commit_replaces_errors_and_notifies() {
        use std::sync::Mutex;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut f = form();
        let sink = Arc::clone(&seen);
        f.on_change(Box::new(move |snap| {
            sink.lock().unwrap().push(snap.errors.len());
        }));

        let e = ready(f.prepare_edit("Traits.Periods", "1", LeafType::UnsignedInteger).unwrap());
        f.commit_edit(
            e,
            vec![
                ValidationError::new("Traits.Periods", "a"),
                ValidationError::new("Traits.Periods", "b"),
            ],
        );
        assert_eq!(f.errors_for("Traits.Periods"), ["a".to_string(), "b".to_string()]);

        let e = ready(f.prepare_edit("Traits.Periods", "2", LeafType::UnsignedInteger).unwrap());
        f.commit_edit(e, vec![]);
        assert!(f.errors_for("Traits.Periods").is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![2, 0]);
    }

    #[test]
    fn abandoned_edit_does_not_leak_into_next_edit() {
        let mut f = form();
        let e = ready(f.prepare_edit("Traits.StopLoss", "9", LeafType::Float).unwrap());
        f.abandon_edit(&e);
        let next = ready(f.prepare_edit("Traits.Periods", "5", LeafType::UnsignedInteger).unwrap());
        assert_eq!(next.config["Traits"]["StopLoss"], json!(2.5));
    }

    #[test]
    fn earlier_snapshots_stay_unchanged() {
        let mut f = form();
        let before = f.config();
        let e = ready(f.prepare_edit("Traits.StopLoss", "1", LeafType::Float).unwrap());
        f.commit_edit(e, vec![]);
        assert_eq!(before["Traits"]["StopLoss"], json!(2.5));
        assert_eq!(f.config()["Traits"]["StopLoss"], json!(1.0));
    }
}
