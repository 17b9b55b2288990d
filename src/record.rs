//! In-memory dataset records exchanged over an association.
//!
//! A [`Record`] is an ordered multi-map from a DICOM tag to one element,
//! where an element holds one or more string values, raw bytes, or a nested
//! list of item records (a sequence). Records are plain values: cloning one
//! never aliases mutable state.

use bytes::Bytes;
use dicom_core::{Tag, VR};
use dicom_dictionary_std::tags;

/// The value of a single record element
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// One or more textual values (value multiplicity via the list length)
    Strings(Vec<String>),
    /// Raw binary value
    Bytes(Bytes),
    /// Nested item records (a sequence)
    Items(Vec<Record>),
}

/// A single element of a record
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    /// Value representation driving matching semantics
    pub vr: VR,
    /// The element value
    pub value: Value,
}

impl Element {
    /// Textual values of this element, if it is textual
    pub fn strings(&self) -> Option<&[String]> {
        match &self.value {
            Value::Strings(v) => Some(v),
            _ => None,
        }
    }

    /// First textual value, if any
    pub fn first_str(&self) -> Option<&str> {
        self.strings().and_then(|v| v.first()).map(String::as_str)
    }

    /// Nested items, if this element is a sequence
    pub fn items(&self) -> Option<&[Record]> {
        match &self.value {
            Value::Items(v) => Some(v),
            _ => None,
        }
    }

    /// Number of values held by this element
    pub fn multiplicity(&self) -> usize {
        match &self.value {
            Value::Strings(v) => v.len(),
            Value::Bytes(b) => usize::from(!b.is_empty()),
            Value::Items(v) => v.len(),
        }
    }

    /// Whether the element carries no value at all.
    ///
    /// An empty value in a query mask means universal match.
    pub fn is_empty_value(&self) -> bool {
        match &self.value {
            Value::Strings(v) => v.is_empty() || v.iter().all(|s| s.is_empty()),
            Value::Bytes(b) => b.is_empty(),
            Value::Items(v) => v.is_empty(),
        }
    }
}

/// An ordered collection of tagged elements
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    elements: Vec<(Tag, Element)>,
}

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the record holds no elements
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate over elements in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&Tag, &Element)> {
        self.elements.iter().map(|(t, e)| (t, e))
    }

    /// Look up an element by tag
    pub fn get(&self, tag: Tag) -> Option<&Element> {
        self.elements.iter().find(|(t, _)| *t == tag).map(|(_, e)| e)
    }

    /// Whether the record holds an element for `tag`
    pub fn contains(&self, tag: Tag) -> bool {
        self.get(tag).is_some()
    }

    /// Insert an element, replacing any existing element for the same tag
    pub fn put(&mut self, tag: Tag, element: Element) {
        if let Some(slot) = self.elements.iter_mut().find(|(t, _)| *t == tag) {
            slot.1 = element;
        } else {
            self.elements.push((tag, element));
        }
    }

    /// Insert a textual element.
    ///
    /// The value is split on `\` into its multiple values, matching the wire
    /// convention for multi-valued fields.
    pub fn put_str(&mut self, tag: Tag, vr: VR, value: impl Into<String>) {
        let value = value.into();
        let values: Vec<String> = if value.is_empty() {
            vec![String::new()]
        } else {
            value.split('\\').map(str::to_string).collect()
        };
        self.put(
            tag,
            Element {
                vr,
                value: Value::Strings(values),
            },
        );
    }

    /// Insert a textual element with explicit multiple values
    pub fn put_strs(&mut self, tag: Tag, vr: VR, values: Vec<String>) {
        self.put(
            tag,
            Element {
                vr,
                value: Value::Strings(values),
            },
        );
    }

    /// Insert a binary element
    pub fn put_bytes(&mut self, tag: Tag, vr: VR, data: Bytes) {
        self.put(
            tag,
            Element {
                vr,
                value: Value::Bytes(data),
            },
        );
    }

    /// Insert a sequence element
    pub fn put_items(&mut self, tag: Tag, items: Vec<Record>) {
        self.put(
            tag,
            Element {
                vr: VR::SQ,
                value: Value::Items(items),
            },
        );
    }

    /// Remove an element by tag
    pub fn remove(&mut self, tag: Tag) -> Option<Element> {
        let idx = self.elements.iter().position(|(t, _)| *t == tag)?;
        Some(self.elements.remove(idx).1)
    }

    /// Textual values for `tag`, if present and textual
    pub fn strings(&self, tag: Tag) -> Option<&[String]> {
        self.get(tag).and_then(Element::strings)
    }

    /// First textual value for `tag`
    pub fn first_str(&self, tag: Tag) -> Option<&str> {
        self.get(tag).and_then(Element::first_str)
    }

    /// Nested items for `tag`, if present and a sequence
    pub fn items(&self, tag: Tag) -> Option<&[Record]> {
        self.get(tag).and_then(Element::items)
    }

    /// SOP class UID identity field, if present
    pub fn sop_class_uid(&self) -> Option<&str> {
        self.first_str(tags::SOP_CLASS_UID)
    }

    /// SOP instance UID identity field, if present
    pub fn sop_instance_uid(&self) -> Option<&str> {
        self.first_str(tags::SOP_INSTANCE_UID)
    }

    /// Query/retrieve level field, if present
    pub fn query_level(&self) -> Option<&str> {
        self.first_str(tags::QUERY_RETRIEVE_LEVEL)
    }
}

impl FromIterator<(Tag, Element)> for Record {
    fn from_iter<I: IntoIterator<Item = (Tag, Element)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (tag, element) in iter {
            record.put(tag, element);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_value_split() {
        let mut record = Record::new();
        record.put_str(tags::SOP_INSTANCE_UID, VR::UI, "1.2.3\\4.5.6");
        let values = record.strings(tags::SOP_INSTANCE_UID).unwrap();
        assert_eq!(values, &["1.2.3".to_string(), "4.5.6".to_string()]);
        assert_eq!(record.get(tags::SOP_INSTANCE_UID).unwrap().multiplicity(), 2);
    }

    #[test]
    fn test_put_replaces_existing() {
        let mut record = Record::new();
        record.put_str(tags::PATIENT_ID, VR::LO, "A");
        record.put_str(tags::PATIENT_ID, VR::LO, "B");
        assert_eq!(record.len(), 1);
        assert_eq!(record.first_str(tags::PATIENT_ID), Some("B"));
    }

    #[test]
    fn test_identity_helpers() {
        let mut record = Record::new();
        record.put_str(tags::SOP_CLASS_UID, VR::UI, "1.2.840.10008.1.1");
        record.put_str(tags::SOP_INSTANCE_UID, VR::UI, "1.2.3.4");
        assert_eq!(record.sop_class_uid(), Some("1.2.840.10008.1.1"));
        assert_eq!(record.sop_instance_uid(), Some("1.2.3.4"));
    }

    #[test]
    fn test_empty_value_detection() {
        let mut record = Record::new();
        record.put_str(tags::PATIENT_ID, VR::LO, "");
        assert!(record.get(tags::PATIENT_ID).unwrap().is_empty_value());
        record.put_str(tags::PATIENT_ID, VR::LO, "X");
        assert!(!record.get(tags::PATIENT_ID).unwrap().is_empty_value());
    }

    #[test]
    fn test_sequence_items() {
        let mut item = Record::new();
        item.put_str(tags::CODE_VALUE, VR::SH, "BP");
        let mut record = Record::new();
        record.put_items(tags::PROCEDURE_CODE_SEQUENCE, vec![item.clone()]);
        assert_eq!(record.items(tags::PROCEDURE_CODE_SEQUENCE).unwrap(), &[item]);
    }

    #[test]
    fn test_clone_is_detached() {
        let mut record = Record::new();
        record.put_str(tags::PATIENT_ID, VR::LO, "A");
        let copy = record.clone();
        record.put_str(tags::PATIENT_ID, VR::LO, "B");
        assert_eq!(copy.first_str(tags::PATIENT_ID), Some("A"));
        assert_eq!(record.first_str(tags::PATIENT_ID), Some("B"));
    }
}
