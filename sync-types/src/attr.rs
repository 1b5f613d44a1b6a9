//! Attribute definitions: the entries of the schema dictionary.

use serde::{Deserialize, Serialize};

use crate::AttrId;

/// One side of an attribute's identity: the namespace it lives on and its label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Entity type (namespace), e.g. `"todos"`.
    pub etype: String,
    /// Attribute label within the namespace, e.g. `"title"`.
    pub label: String,
}

impl Identity {
    /// Create an identity.
    pub fn new(etype: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            etype: etype.into(),
            label: label.into(),
        }
    }
}

/// How many values an entity may hold for an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cardinality {
    /// At most one value per entity.
    One,
    /// Any number of values per entity.
    Many,
}

/// Whether an attribute stores plain data or a link to another entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueType {
    /// Arbitrary JSON value.
    Blob,
    /// Entity id of a linked entity.
    Ref,
}

/// Who owns an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Catalog {
    /// Defined by the application.
    #[default]
    User,
    /// Defined by the system (e.g. `$users`).
    System,
}

/// Checked data type of a blob attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    /// UTF-8 string.
    String,
    /// JSON number.
    Number,
    /// `true` / `false`.
    Boolean,
    /// Point in time, normalized to epoch milliseconds.
    Date,
    /// Any JSON value.
    Json,
}

/// What happens to linked entities when one side of a ref is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnDelete {
    /// Delete the entity on the other side as well.
    Cascade,
}

/// An attribute in the schema dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute id.
    pub id: AttrId,
    /// Namespace and label on the owning side.
    pub forward_identity: Identity,
    /// Namespace and label on the linked side (refs only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_identity: Option<Identity>,
    /// Values per entity.
    pub cardinality: Cardinality,
    /// Plain data or link.
    pub value_type: ValueType,
    /// No two entities may share a value.
    #[serde(default)]
    pub unique: bool,
    /// Indexed for lookups and ordering.
    #[serde(default)]
    pub indexed: bool,
    /// Value may not be null or missing.
    #[serde(default)]
    pub required: bool,
    /// Ownership.
    #[serde(default)]
    pub catalog: Catalog,
    /// Checked data type for coercion and validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_data_type: Option<DataType>,
    /// Deleting the linked (value-side) entity deletes the owning entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<OnDelete>,
    /// Deleting the owning entity deletes the linked (value-side) entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete_reverse: Option<OnDelete>,
}

impl Attribute {
    /// Create a plain data attribute with cardinality one.
    pub fn blob(etype: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: AttrId::new(),
            forward_identity: Identity::new(etype, label),
            reverse_identity: None,
            cardinality: Cardinality::One,
            value_type: ValueType::Blob,
            unique: false,
            indexed: false,
            required: false,
            catalog: Catalog::User,
            checked_data_type: None,
            on_delete: None,
            on_delete_reverse: None,
        }
    }

    /// Create the `id` attribute every namespace carries.
    pub fn id_attr(etype: impl Into<String>) -> Self {
        Self {
            unique: true,
            indexed: true,
            ..Self::blob(etype, "id")
        }
    }

    /// Create a link attribute from `forward` to `reverse`.
    pub fn link(forward: Identity, reverse: Identity, cardinality: Cardinality) -> Self {
        Self {
            id: AttrId::new(),
            forward_identity: forward,
            reverse_identity: Some(reverse),
            cardinality,
            value_type: ValueType::Ref,
            unique: false,
            indexed: true,
            required: false,
            catalog: Catalog::User,
            checked_data_type: None,
            on_delete: None,
            on_delete_reverse: None,
        }
    }

    /// Set the checked data type.
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.checked_data_type = Some(data_type);
        self
    }

    /// Mark the attribute unique (and indexed).
    pub fn with_unique(mut self) -> Self {
        self.unique = true;
        self.indexed = true;
        self
    }

    /// Mark the attribute required.
    pub fn with_required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Mark the attribute indexed.
    pub fn with_indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Set the cardinality.
    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    /// Cascade deletes from the linked entity to the owning entity.
    pub fn with_on_delete_cascade(mut self) -> Self {
        self.on_delete = Some(OnDelete::Cascade);
        self
    }

    /// Cascade deletes from the owning entity to the linked entity.
    pub fn with_on_delete_reverse_cascade(mut self) -> Self {
        self.on_delete_reverse = Some(OnDelete::Cascade);
        self
    }

    /// Whether this is a link attribute.
    pub fn is_ref(&self) -> bool {
        self.value_type == ValueType::Ref
    }

    /// Whether the reverse side of this link yields a single entity.
    ///
    /// A unique forward attribute means each target has at most one owner.
    pub fn reverse_is_single(&self) -> bool {
        self.unique
    }

    /// Apply a partial update in place.
    pub fn apply_patch(&mut self, patch: &AttrPatch) {
        if let Some(unique) = patch.unique {
            self.unique = unique;
        }
        if let Some(indexed) = patch.indexed {
            self.indexed = indexed;
        }
        if let Some(required) = patch.required {
            self.required = required;
        }
        if let Some(cardinality) = patch.cardinality {
            self.cardinality = cardinality;
        }
        if let Some(data_type) = patch.checked_data_type {
            self.checked_data_type = data_type;
        }
        if let Some(on_delete) = patch.on_delete {
            self.on_delete = on_delete;
        }
        if let Some(on_delete_reverse) = patch.on_delete_reverse {
            self.on_delete_reverse = on_delete_reverse;
        }
        if let Some(label) = &patch.label {
            self.forward_identity.label = label.clone();
        }
    }
}

/// Partial update of an attribute (`update-attr`).
///
/// `None` leaves the field untouched. For optional fields the inner `None`
/// clears the setting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrPatch {
    /// Attribute to update.
    pub id: AttrId,
    /// New uniqueness flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<bool>,
    /// New indexed flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed: Option<bool>,
    /// New required flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    /// New cardinality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<Cardinality>,
    /// New checked data type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_data_type: Option<Option<DataType>>,
    /// New forward cascade setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<Option<OnDelete>>,
    /// New reverse cascade setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete_reverse: Option<Option<OnDelete>>,
    /// Rename the forward label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl AttrPatch {
    /// Create an empty patch for an attribute.
    pub fn new(id: AttrId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_attr_is_unique_and_indexed() {
        let attr = Attribute::id_attr("todos");
        assert!(attr.unique);
        assert!(attr.indexed);
        assert_eq!(attr.forward_identity.label, "id");
    }

    #[test]
    fn attribute_serializes_kebab_enums() {
        let attr = Attribute::blob("todos", "due").with_data_type(DataType::Date);
        let value = serde_json::to_value(&attr).unwrap();
        assert_eq!(value["cardinality"], json!("one"));
        assert_eq!(value["value_type"], json!("blob"));
        assert_eq!(value["checked_data_type"], json!("date"));
        assert!(value.get("reverse_identity").is_none());
    }

    #[test]
    fn patch_updates_only_given_fields() {
        let mut attr = Attribute::blob("todos", "title");
        let mut patch = AttrPatch::new(attr.id);
        patch.unique = Some(true);
        patch.checked_data_type = Some(Some(DataType::String));
        attr.apply_patch(&patch);

        assert!(attr.unique);
        assert!(!attr.required);
        assert_eq!(attr.checked_data_type, Some(DataType::String));
    }

    #[test]
    fn patch_can_clear_optional_setting() {
        let mut attr = Attribute::link(
            Identity::new("todos", "owner"),
            Identity::new("users", "todos"),
            Cardinality::One,
        )
        .with_on_delete_cascade();
        let mut patch = AttrPatch::new(attr.id);
        patch.on_delete = Some(None);
        attr.apply_patch(&patch);
        assert_eq!(attr.on_delete, None);
    }
}
