//! Column (`Key`) definitions.
//!
//! # Responsibility
//! - Define the closed set of column types and their per-type configuration.
//! - Format numbers according to a column's number format.
//!
//! # Invariants
//! - `Key::key_type()` is derived from the configuration variant, so a key can
//!   never carry configuration that belongs to another type.
//! - Exactly one key per attribute view has type `block` (primary column).

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Closed set of column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyType {
    /// Primary column; its values enumerate every row.
    Block,
    Text,
    Number,
    Date,
    Select,
    MSelect,
    Url,
    Email,
    Phone,
    MAsset,
    Checkbox,
    Template,
    Created,
    Updated,
    Relation,
    Rollup,
}

impl KeyType {
    /// Types a caller may create through column operations.
    pub const CREATABLE: [KeyType; 15] = [
        KeyType::Text,
        KeyType::Number,
        KeyType::Date,
        KeyType::Select,
        KeyType::MSelect,
        KeyType::Url,
        KeyType::Email,
        KeyType::Phone,
        KeyType::MAsset,
        KeyType::Checkbox,
        KeyType::Template,
        KeyType::Created,
        KeyType::Updated,
        KeyType::Relation,
        KeyType::Rollup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Text => "text",
            Self::Number => "number",
            Self::Date => "date",
            Self::Select => "select",
            Self::MSelect => "mSelect",
            Self::Url => "url",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::MAsset => "mAsset",
            Self::Checkbox => "checkbox",
            Self::Template => "template",
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Relation => "relation",
            Self::Rollup => "rollup",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::CREATABLE
            .into_iter()
            .chain(std::iter::once(Self::Block))
            .find(|kind| kind.as_str() == value)
    }

    /// Whether values of this type are computed at render time instead of
    /// stored.
    pub fn is_derived(self) -> bool {
        matches!(
            self,
            Self::Template | Self::Created | Self::Updated | Self::Rollup
        )
    }
}

impl Display for KeyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display format applied to number columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumberFormat {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "commas")]
    Commas,
    #[serde(rename = "percent")]
    Percent,
    #[serde(rename = "usDollar")]
    UsDollar,
    #[serde(rename = "yuan")]
    Yuan,
    #[serde(rename = "euro")]
    Euro,
    #[serde(rename = "pound")]
    Pound,
    #[serde(rename = "yen")]
    Yen,
    #[serde(rename = "ruble")]
    Ruble,
    #[serde(rename = "rupee")]
    Rupee,
    #[serde(rename = "won")]
    Won,
    #[serde(rename = "canadianDollar")]
    CanadianDollar,
    #[serde(rename = "franc")]
    Franc,
}

impl NumberFormat {
    /// Renders `value` for display.
    pub fn format(self, value: f64) -> String {
        match self {
            Self::None => trim_float(value),
            Self::Commas => group_number(value, None),
            Self::Percent => format!("{}%", trim_float((value * 10000.0).round() / 100.0)),
            Self::UsDollar => currency("$", value, 2),
            Self::Yuan => currency("¥", value, 2),
            Self::Euro => currency("€", value, 2),
            Self::Pound => currency("£", value, 2),
            Self::Yen => currency("¥", value, 0),
            Self::Ruble => currency("₽", value, 2),
            Self::Rupee => currency("₹", value, 2),
            Self::Won => currency("₩", value, 0),
            Self::CanadianDollar => currency("CA$", value, 2),
            Self::Franc => currency("CHF ", value, 2),
        }
    }
}

/// Prints a float without a trailing `.0` for integral values.
pub fn trim_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

fn currency(symbol: &str, value: f64, decimals: usize) -> String {
    let body = group_number(value.abs(), Some(decimals));
    if value < 0.0 {
        format!("-{symbol}{body}")
    } else {
        format!("{symbol}{body}")
    }
}

fn group_number(value: f64, decimals: Option<usize>) -> String {
    let text = match decimals {
        Some(places) => format!("{:.*}", places, value.abs()),
        None => trim_float(value.abs()),
    };
    let (int_part, frac_part) = match text.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (text.as_str(), None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (index, digit) in int_part.chars().enumerate() {
        if index > 0 && (int_part.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    if let Some(frac_part) = frac_part {
        grouped.push('.');
        grouped.push_str(frac_part);
    }
    if value < 0.0 {
        grouped.insert(0, '-');
    }
    grouped
}

/// One entry of a select/multi-select option palette.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub name: String,
    #[serde(default)]
    pub color: String,
}

/// Relation column configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationConfig {
    /// Target attribute view.
    #[serde(rename = "avID")]
    pub av_id: String,
    #[serde(rename = "isTwoWay", default)]
    pub is_two_way: bool,
    /// Paired column in the target view, set only for two-way relations.
    #[serde(rename = "backKeyID", default)]
    pub back_key_id: String,
}

/// Rollup column configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupConfig {
    /// Relation column (in the same attribute view) the rollup follows.
    #[serde(rename = "relationKeyID", default)]
    pub relation_key_id: String,
    /// Column in the relation's target view that is aggregated.
    #[serde(rename = "keyID", default)]
    pub key_id: String,
    #[serde(default)]
    pub calc: Option<RollupCalc>,
}

/// Aggregation applied to rollup contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupCalc {
    #[serde(default)]
    pub operator: super::view::CalcOperator,
}

/// Per-type column configuration; the variant is the column type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum KeyConfig {
    Block,
    Text,
    Number {
        #[serde(rename = "numberFormat", default)]
        number_format: NumberFormat,
    },
    Date,
    Select {
        #[serde(default)]
        options: Vec<SelectOption>,
    },
    MSelect {
        #[serde(default)]
        options: Vec<SelectOption>,
    },
    Url,
    Email,
    Phone,
    MAsset,
    Checkbox,
    Template {
        #[serde(default)]
        template: String,
    },
    Created,
    Updated,
    Relation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relation: Option<RelationConfig>,
    },
    Rollup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rollup: Option<RollupConfig>,
    },
}

impl KeyConfig {
    /// Default configuration for a freshly created column of `key_type`.
    pub fn default_for(key_type: KeyType) -> Self {
        match key_type {
            KeyType::Block => Self::Block,
            KeyType::Text => Self::Text,
            KeyType::Number => Self::Number {
                number_format: NumberFormat::None,
            },
            KeyType::Date => Self::Date,
            KeyType::Select => Self::Select {
                options: Vec::new(),
            },
            KeyType::MSelect => Self::MSelect {
                options: Vec::new(),
            },
            KeyType::Url => Self::Url,
            KeyType::Email => Self::Email,
            KeyType::Phone => Self::Phone,
            KeyType::MAsset => Self::MAsset,
            KeyType::Checkbox => Self::Checkbox,
            KeyType::Template => Self::Template {
                template: String::new(),
            },
            KeyType::Created => Self::Created,
            KeyType::Updated => Self::Updated,
            KeyType::Relation => Self::Relation { relation: None },
            KeyType::Rollup => Self::Rollup {
                rollup: Some(RollupConfig {
                    relation_key_id: String::new(),
                    key_id: String::new(),
                    calc: Some(RollupCalc::default()),
                }),
            },
        }
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Block => KeyType::Block,
            Self::Text => KeyType::Text,
            Self::Number { .. } => KeyType::Number,
            Self::Date => KeyType::Date,
            Self::Select { .. } => KeyType::Select,
            Self::MSelect { .. } => KeyType::MSelect,
            Self::Url => KeyType::Url,
            Self::Email => KeyType::Email,
            Self::Phone => KeyType::Phone,
            Self::MAsset => KeyType::MAsset,
            Self::Checkbox => KeyType::Checkbox,
            Self::Template { .. } => KeyType::Template,
            Self::Created => KeyType::Created,
            Self::Updated => KeyType::Updated,
            Self::Relation { .. } => KeyType::Relation,
            Self::Rollup { .. } => KeyType::Rollup,
        }
    }
}

/// Typed column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(flatten)]
    pub config: KeyConfig,
}

impl Key {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        icon: impl Into<String>,
        key_type: KeyType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            icon: icon.into(),
            config: KeyConfig::default_for(key_type),
        }
    }

    pub fn key_type(&self) -> KeyType {
        self.config.key_type()
    }

    /// Changes the column type, keeping configuration that survives the
    /// change (select options between single and multi select).
    pub fn retype(&mut self, key_type: KeyType) {
        if self.key_type() == key_type {
            return;
        }
        let options = self.options().to_vec();
        self.config = KeyConfig::default_for(key_type);
        if let Some(target) = self.options_mut() {
            *target = options;
        }
    }

    pub fn number_format(&self) -> NumberFormat {
        match &self.config {
            KeyConfig::Number { number_format } => *number_format,
            _ => NumberFormat::None,
        }
    }

    pub fn options(&self) -> &[SelectOption] {
        match &self.config {
            KeyConfig::Select { options } | KeyConfig::MSelect { options } => options,
            _ => &[],
        }
    }

    pub fn options_mut(&mut self) -> Option<&mut Vec<SelectOption>> {
        match &mut self.config {
            KeyConfig::Select { options } | KeyConfig::MSelect { options } => Some(options),
            _ => None,
        }
    }

    pub fn template(&self) -> Option<&str> {
        match &self.config {
            KeyConfig::Template { template } => Some(template.as_str()),
            _ => None,
        }
    }

    pub fn relation(&self) -> Option<&RelationConfig> {
        match &self.config {
            KeyConfig::Relation { relation } => relation.as_ref(),
            _ => None,
        }
    }

    pub fn relation_mut(&mut self) -> Option<&mut Option<RelationConfig>> {
        match &mut self.config {
            KeyConfig::Relation { relation } => Some(relation),
            _ => None,
        }
    }

    pub fn rollup(&self) -> Option<&RollupConfig> {
        match &self.config {
            KeyConfig::Rollup { rollup } => rollup.as_ref(),
            _ => None,
        }
    }
}
