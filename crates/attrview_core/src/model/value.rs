//! Cell (`Value`) model.
//!
//! # Responsibility
//! - Carry exactly one type-specific payload per cell.
//! - Provide typed defaults, display text and deep copies for derived cells.
//!
//! # Invariants
//! - `Value::key_type()` is the payload variant; it must equal the owning
//!   key's type (checked when a cell is written).
//! - Relation display contents and rollup contents are derived at render time
//!   and stripped before persistence.

use crate::model::id::{millis_to_local, new_node_id};
use crate::model::key::{trim_float, KeyType, NumberFormat};
use serde::{Deserialize, Serialize};

const DATE_TIME_DISPLAY: &str = "%Y-%m-%d %H:%M";
const DATE_DISPLAY: &str = "%Y-%m-%d";

/// Primary column payload: the row's binding to a document block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockPayload {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default)]
    pub content: String,
    /// Epoch ms.
    #[serde(default)]
    pub created: i64,
    /// Epoch ms.
    #[serde(default)]
    pub updated: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextPayload {
    #[serde(default)]
    pub content: String,
}

impl TextPayload {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumberPayload {
    #[serde(default)]
    pub content: f64,
    #[serde(rename = "isNotEmpty", default)]
    pub is_not_empty: bool,
    #[serde(default)]
    pub format: NumberFormat,
    #[serde(rename = "formattedContent", default)]
    pub formatted_content: String,
}

impl NumberPayload {
    pub fn new(content: f64) -> Self {
        let mut payload = Self {
            content,
            is_not_empty: true,
            format: NumberFormat::None,
            formatted_content: String::new(),
        };
        payload.apply_format(NumberFormat::None);
        payload
    }

    /// Sets the display format and refreshes `formatted_content`.
    pub fn apply_format(&mut self, format: NumberFormat) {
        self.format = format;
        self.formatted_content = if self.is_not_empty {
            format.format(self.content)
        } else {
            String::new()
        };
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatePayload {
    /// Epoch ms.
    #[serde(default)]
    pub content: i64,
    #[serde(rename = "isNotEmpty", default)]
    pub is_not_empty: bool,
    #[serde(rename = "hasEndDate", default)]
    pub has_end_date: bool,
    #[serde(rename = "isNotTime", default)]
    pub is_not_time: bool,
    /// End date, epoch ms.
    #[serde(default)]
    pub content2: i64,
    #[serde(rename = "isNotEmpty2", default)]
    pub is_not_empty2: bool,
}

impl DatePayload {
    pub fn new(millis: i64) -> Self {
        Self {
            content: millis,
            is_not_empty: true,
            ..Self::default()
        }
    }

    fn display(&self) -> String {
        if !self.is_not_empty {
            return String::new();
        }
        let layout = if self.is_not_time {
            DATE_DISPLAY
        } else {
            DATE_TIME_DISPLAY
        };
        let start = millis_to_local(self.content).format(layout).to_string();
        if self.has_end_date && self.is_not_empty2 {
            let end = millis_to_local(self.content2).format(layout).to_string();
            format!("{start} → {end}")
        } else {
            start
        }
    }
}

/// Created/updated timestamp payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimestampPayload {
    /// Epoch ms.
    #[serde(default)]
    pub content: i64,
    #[serde(rename = "isNotEmpty", default)]
    pub is_not_empty: bool,
    #[serde(rename = "formattedContent", default)]
    pub formatted_content: String,
}

impl TimestampPayload {
    pub fn new(millis: i64, is_not_empty: bool) -> Self {
        Self {
            content: millis,
            is_not_empty,
            formatted_content: millis_to_local(millis)
                .format(DATE_TIME_DISPLAY)
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectItem {
    pub content: String,
    #[serde(default)]
    pub color: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetKind {
    #[default]
    File,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetItem {
    #[serde(rename = "type", default)]
    pub kind: AssetKind,
    #[serde(default)]
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckboxPayload {
    #[serde(default)]
    pub checked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationPayload {
    /// Related row IDs in the target attribute view.
    #[serde(rename = "blockIDs", default)]
    pub block_ids: Vec<String>,
    /// Display text of each related row; derived.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contents: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollupPayload {
    /// Related target values (or the aggregate); derived.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contents: Vec<Value>,
}

/// Type-tagged cell payload; the variant is the cell type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ValuePayload {
    Block {
        #[serde(default)]
        block: BlockPayload,
    },
    Text {
        #[serde(default)]
        text: TextPayload,
    },
    Number {
        #[serde(default)]
        number: NumberPayload,
    },
    Date {
        #[serde(default)]
        date: DatePayload,
    },
    Select {
        #[serde(rename = "mSelect", default)]
        items: Vec<SelectItem>,
    },
    MSelect {
        #[serde(rename = "mSelect", default)]
        items: Vec<SelectItem>,
    },
    Url {
        #[serde(default)]
        url: TextPayload,
    },
    Email {
        #[serde(default)]
        email: TextPayload,
    },
    Phone {
        #[serde(default)]
        phone: TextPayload,
    },
    MAsset {
        #[serde(rename = "mAsset", default)]
        assets: Vec<AssetItem>,
    },
    Checkbox {
        #[serde(default)]
        checkbox: CheckboxPayload,
    },
    Template {
        #[serde(default)]
        template: TextPayload,
    },
    Created {
        #[serde(default)]
        created: TimestampPayload,
    },
    Updated {
        #[serde(default)]
        updated: TimestampPayload,
    },
    Relation {
        #[serde(default)]
        relation: RelationPayload,
    },
    Rollup {
        #[serde(default)]
        rollup: RollupPayload,
    },
}

impl ValuePayload {
    /// Empty payload of the given type.
    pub fn default_for(key_type: KeyType) -> Self {
        match key_type {
            KeyType::Block => Self::Block {
                block: BlockPayload::default(),
            },
            KeyType::Text => Self::Text {
                text: TextPayload::default(),
            },
            KeyType::Number => Self::Number {
                number: NumberPayload::default(),
            },
            KeyType::Date => Self::Date {
                date: DatePayload::default(),
            },
            KeyType::Select => Self::Select { items: Vec::new() },
            KeyType::MSelect => Self::MSelect { items: Vec::new() },
            KeyType::Url => Self::Url {
                url: TextPayload::default(),
            },
            KeyType::Email => Self::Email {
                email: TextPayload::default(),
            },
            KeyType::Phone => Self::Phone {
                phone: TextPayload::default(),
            },
            KeyType::MAsset => Self::MAsset { assets: Vec::new() },
            KeyType::Checkbox => Self::Checkbox {
                checkbox: CheckboxPayload::default(),
            },
            KeyType::Template => Self::Template {
                template: TextPayload::default(),
            },
            KeyType::Created => Self::Created {
                created: TimestampPayload::default(),
            },
            KeyType::Updated => Self::Updated {
                updated: TimestampPayload::default(),
            },
            KeyType::Relation => Self::Relation {
                relation: RelationPayload::default(),
            },
            KeyType::Rollup => Self::Rollup {
                rollup: RollupPayload::default(),
            },
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            text: TextPayload::new(content),
        }
    }

    pub fn number(content: f64) -> Self {
        Self::Number {
            number: NumberPayload::new(content),
        }
    }

    pub fn checkbox(checked: bool) -> Self {
        Self::Checkbox {
            checkbox: CheckboxPayload { checked },
        }
    }

    pub fn relation(block_ids: Vec<String>) -> Self {
        Self::Relation {
            relation: RelationPayload {
                block_ids,
                contents: Vec::new(),
            },
        }
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Block { .. } => KeyType::Block,
            Self::Text { .. } => KeyType::Text,
            Self::Number { .. } => KeyType::Number,
            Self::Date { .. } => KeyType::Date,
            Self::Select { .. } => KeyType::Select,
            Self::MSelect { .. } => KeyType::MSelect,
            Self::Url { .. } => KeyType::Url,
            Self::Email { .. } => KeyType::Email,
            Self::Phone { .. } => KeyType::Phone,
            Self::MAsset { .. } => KeyType::MAsset,
            Self::Checkbox { .. } => KeyType::Checkbox,
            Self::Template { .. } => KeyType::Template,
            Self::Created { .. } => KeyType::Created,
            Self::Updated { .. } => KeyType::Updated,
            Self::Relation { .. } => KeyType::Relation,
            Self::Rollup { .. } => KeyType::Rollup,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Block { block } => block.content.is_empty(),
            Self::Text { text: payload }
            | Self::Url { url: payload }
            | Self::Email { email: payload }
            | Self::Phone { phone: payload }
            | Self::Template { template: payload } => payload.content.is_empty(),
            Self::Number { number } => !number.is_not_empty,
            Self::Date { date } => !date.is_not_empty,
            Self::Select { items } | Self::MSelect { items } => items.is_empty(),
            Self::MAsset { assets } => assets.is_empty(),
            Self::Checkbox { checkbox } => !checkbox.checked,
            Self::Created { created: stamp } | Self::Updated { updated: stamp } => {
                !stamp.is_not_empty
            }
            Self::Relation { relation } => relation.block_ids.is_empty(),
            Self::Rollup { rollup } => rollup.contents.iter().all(|value| value.is_empty()),
        }
    }

    /// Display text of the cell.
    pub fn to_text(&self) -> String {
        match self {
            Self::Block { block } => block.content.clone(),
            Self::Text { text: payload }
            | Self::Url { url: payload }
            | Self::Email { email: payload }
            | Self::Phone { phone: payload }
            | Self::Template { template: payload } => payload.content.clone(),
            Self::Number { number } => {
                if !number.is_not_empty {
                    String::new()
                } else if number.formatted_content.is_empty() {
                    trim_float(number.content)
                } else {
                    number.formatted_content.clone()
                }
            }
            Self::Date { date } => date.display(),
            Self::Select { items } | Self::MSelect { items } => items
                .iter()
                .map(|item| item.content.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            Self::MAsset { assets } => assets
                .iter()
                .map(|asset| asset.content.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            Self::Checkbox { checkbox } => {
                if checkbox.checked {
                    "√".to_string()
                } else {
                    String::new()
                }
            }
            Self::Created { created: stamp } | Self::Updated { updated: stamp } => {
                if stamp.content == 0 {
                    String::new()
                } else if stamp.formatted_content.is_empty() {
                    millis_to_local(stamp.content)
                        .format(DATE_TIME_DISPLAY)
                        .to_string()
                } else {
                    stamp.formatted_content.clone()
                }
            }
            Self::Relation { relation } => relation.contents.join(", "),
            Self::Rollup { rollup } => rollup
                .contents
                .iter()
                .map(Value::to_text)
                .filter(|text| !text.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    pub fn block(&self) -> Option<&BlockPayload> {
        match self {
            Self::Block { block } => Some(block),
            _ => None,
        }
    }

    pub fn block_mut(&mut self) -> Option<&mut BlockPayload> {
        match self {
            Self::Block { block } => Some(block),
            _ => None,
        }
    }

    pub fn number_payload(&self) -> Option<&NumberPayload> {
        match self {
            Self::Number { number } => Some(number),
            _ => None,
        }
    }

    pub fn number_payload_mut(&mut self) -> Option<&mut NumberPayload> {
        match self {
            Self::Number { number } => Some(number),
            _ => None,
        }
    }

    pub fn relation_payload(&self) -> Option<&RelationPayload> {
        match self {
            Self::Relation { relation } => Some(relation),
            _ => None,
        }
    }

    pub fn relation_payload_mut(&mut self) -> Option<&mut RelationPayload> {
        match self {
            Self::Relation { relation } => Some(relation),
            _ => None,
        }
    }

    pub fn rollup_payload_mut(&mut self) -> Option<&mut RollupPayload> {
        match self {
            Self::Rollup { rollup } => Some(rollup),
            _ => None,
        }
    }

    pub fn select_items(&self) -> Option<&[SelectItem]> {
        match self {
            Self::Select { items } | Self::MSelect { items } => Some(items),
            _ => None,
        }
    }

    pub fn select_items_mut(&mut self) -> Option<&mut Vec<SelectItem>> {
        match self {
            Self::Select { items } | Self::MSelect { items } => Some(items),
            _ => None,
        }
    }

    /// Numeric view used by calculations; `None` for empty or non-numeric
    /// cells.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number { number } if number.is_not_empty => Some(number.content),
            _ => None,
        }
    }

    /// Millisecond timestamp used by date calculations.
    pub fn as_millis(&self) -> Option<i64> {
        match self {
            Self::Date { date } if date.is_not_empty => Some(date.content),
            Self::Created { created: stamp } | Self::Updated { updated: stamp }
                if stamp.content != 0 =>
            {
                Some(stamp.content)
            }
            _ => None,
        }
    }
}

/// One cell, owned by a (key, row) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub id: String,
    #[serde(rename = "keyID")]
    pub key_id: String,
    /// Row identity; equals the bound document block ID for bound rows.
    #[serde(rename = "blockID")]
    pub block_id: String,
    #[serde(rename = "isDetached", default)]
    pub is_detached: bool,
    #[serde(flatten)]
    pub payload: ValuePayload,
}

impl Value {
    pub fn new(
        key_id: impl Into<String>,
        block_id: impl Into<String>,
        payload: ValuePayload,
    ) -> Self {
        Self {
            id: new_node_id(),
            key_id: key_id.into(),
            block_id: block_id.into(),
            is_detached: false,
            payload,
        }
    }

    /// Typed empty placeholder for a cell that has no stored value.
    pub fn default_for(
        key_id: impl Into<String>,
        block_id: impl Into<String>,
        key_type: KeyType,
    ) -> Self {
        Self::new(key_id, block_id, ValuePayload::default_for(key_type))
    }

    pub fn key_type(&self) -> KeyType {
        self.payload.key_type()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn to_text(&self) -> String {
        self.payload.to_text()
    }

    /// Deep copy re-homed onto another row with a fresh cell ID.
    pub fn duplicate_for_row(&self, block_id: &str, is_detached: bool) -> Self {
        let mut copy = self.clone();
        copy.id = new_node_id();
        copy.block_id = block_id.to_string();
        copy.is_detached = is_detached;
        copy
    }

    /// Drops derived payload contents that must never be persisted.
    pub fn strip_derived(&mut self) {
        match &mut self.payload {
            ValuePayload::Relation { relation } => relation.contents.clear(),
            ValuePayload::Rollup { rollup } => rollup.contents.clear(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockPayload, Value, ValuePayload};
    use crate::model::key::{KeyType, NumberFormat};

    #[test]
    fn value_json_carries_type_tag_and_payload() {
        let value = Value::new("k1", "20240101120000-aaaaaaa", ValuePayload::text("Alice"));
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"]["content"], "Alice");
        assert_eq!(json["keyID"], "k1");

        let parsed: Value = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, value);
    }

    #[test]
    fn value_parses_select_and_block_payloads() {
        let select: Value = serde_json::from_str(
            r#"{"id":"v","keyID":"k","blockID":"b","type":"mSelect","mSelect":[{"content":"a","color":"1"}]}"#,
        )
        .unwrap();
        assert_eq!(select.key_type(), KeyType::MSelect);
        assert_eq!(select.to_text(), "a");

        let block: Value = serde_json::from_str(
            r#"{"id":"v","keyID":"k","blockID":"b","type":"block","isDetached":true,"block":{"id":"b","content":"Row","created":1,"updated":2}}"#,
        )
        .unwrap();
        assert!(block.is_detached);
        assert_eq!(
            block.payload.block(),
            Some(&BlockPayload {
                id: "b".to_string(),
                icon: String::new(),
                content: "Row".to_string(),
                created: 1,
                updated: 2,
            })
        );
    }

    #[test]
    fn defaults_are_typed_and_empty() {
        for kind in KeyType::CREATABLE {
            let value = Value::default_for("k", "b", kind);
            assert_eq!(value.key_type(), kind);
            assert!(value.is_empty(), "{kind} default should be empty");
        }
    }

    #[test]
    fn derived_contents_are_stripped() {
        let mut value = Value::new("k", "b", ValuePayload::relation(vec!["r1".to_string()]));
        value
            .payload
            .relation_payload_mut()
            .unwrap()
            .contents
            .push("Row 1".to_string());
        value.strip_derived();
        let relation = value.payload.relation_payload().unwrap();
        assert_eq!(relation.block_ids, vec!["r1".to_string()]);
        assert!(relation.contents.is_empty());
    }

    #[test]
    fn number_text_uses_format() {
        let mut value = Value::new("k", "b", ValuePayload::number(1500.0));
        value
            .payload
            .number_payload_mut()
            .unwrap()
            .apply_format(NumberFormat::Commas);
        assert_eq!(value.to_text(), "1,500");
    }

    #[test]
    fn duplicate_for_row_rehomes_with_new_id() {
        let value = Value::new("k", "b1", ValuePayload::text("x"));
        let copy = value.duplicate_for_row("b2", true);
        assert_ne!(copy.id, value.id);
        assert_eq!(copy.block_id, "b2");
        assert!(copy.is_detached);
        assert_eq!(copy.payload, value.payload);
    }
}
