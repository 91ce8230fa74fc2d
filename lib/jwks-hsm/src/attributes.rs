//! Device object attributes and key-pair generation templates

use std::collections::BTreeMap;

use crate::jwk::Usage;

/// Attribute kinds this manager reads or writes on device objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttributeKind {
    Id,
    Label,
    Sign,
    Verify,
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Id(Vec<u8>),
    Label(Vec<u8>),
    Sign(bool),
    Verify(bool),
    Encrypt(bool),
    Decrypt(bool),
}

impl Attribute {
    pub fn kind(&self) -> AttributeKind {
        match self {
            Attribute::Id(_) => AttributeKind::Id,
            Attribute::Label(_) => AttributeKind::Label,
            Attribute::Sign(_) => AttributeKind::Sign,
            Attribute::Verify(_) => AttributeKind::Verify,
            Attribute::Encrypt(_) => AttributeKind::Encrypt,
            Attribute::Decrypt(_) => AttributeKind::Decrypt,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attribute::Sign(v) | Attribute::Verify(v) | Attribute::Encrypt(v) | Attribute::Decrypt(v) => {
                Some(*v)
            }
            Attribute::Id(_) | Attribute::Label(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Attribute::Id(v) | Attribute::Label(v) => Some(v),
            _ => None,
        }
    }
}

/// A template of attributes, at most one per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSet(BTreeMap<AttributeKind, Attribute>);

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id_and_label(id: &[u8], label: &[u8]) -> Self {
        let mut set = Self::new();
        set.set(Attribute::Id(id.to_vec()));
        set.set(Attribute::Label(label.to_vec()));
        set
    }

    /// Insert or replace an attribute.
    pub fn set(&mut self, attribute: Attribute) {
        self.0.insert(attribute.kind(), attribute);
    }

    /// Insert each attribute whose kind is not already present.
    pub fn add_if_not_present(&mut self, attributes: impl IntoIterator<Item = Attribute>) {
        for attribute in attributes {
            self.0.entry(attribute.kind()).or_insert(attribute);
        }
    }

    pub fn get(&self, kind: AttributeKind) -> Option<&Attribute> {
        self.0.get(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.values()
    }
}

impl FromIterator<Attribute> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        let mut set = Self::new();
        for attribute in iter {
            set.set(attribute);
        }
        set
    }
}

/// Public and private object templates for one key-pair generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairTemplates {
    pub public: AttributeSet,
    pub private: AttributeSet,
}

impl KeyPairTemplates {
    /// Templates carrying only the key identifier and set label.
    pub fn new(kid: &str, label: &str) -> Self {
        Self {
            public: AttributeSet::with_id_and_label(kid.as_bytes(), label.as_bytes()),
            private: AttributeSet::with_id_and_label(kid.as_bytes(), label.as_bytes()),
        }
    }

    /// Fill in capability flags the caller has not set: keys verify and sign,
    /// and neither encrypt nor decrypt.
    pub fn with_default_capabilities(mut self) -> Self {
        self.public
            .add_if_not_present([Attribute::Verify(true), Attribute::Encrypt(false)]);
        self.private
            .add_if_not_present([Attribute::Sign(true), Attribute::Decrypt(false)]);
        self
    }

    /// Templates for a key generated with the given usage.
    pub fn for_usage(kid: &str, label: &str, usage: Usage) -> Self {
        let mut templates = Self::new(kid, label);
        if usage == Usage::Encryption {
            templates.public.set(Attribute::Encrypt(true));
            templates.private.set(Attribute::Decrypt(true));
        }
        templates.with_default_capabilities()
    }
}
