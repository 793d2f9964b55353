//! Relationship metadata.
//!
//! Relationships are declared once, as static metadata on each [`Mapper`],
//! and drive both cascade discovery and write ordering during a flush.
//!
//! [`Mapper`]: crate::Mapper

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The type of relationship between two entity types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipKind {
    /// One-to-one: `User` has one `Profile`; the foreign key lives on the target.
    OneToOne,
    /// Many-to-one: many `Book`s belong to one `Author`; the foreign key lives
    /// on the owner.
    #[default]
    ManyToOne,
    /// One-to-many: one `Author` has many `Book`s; the foreign key lives on
    /// the target.
    OneToMany,
    /// Many-to-many: `Book`s have many `Tag`s via a link table.
    ManyToMany,
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelationshipKind::OneToOne => "one-to-one",
            RelationshipKind::ManyToOne => "many-to-one",
            RelationshipKind::OneToMany => "one-to-many",
            RelationshipKind::ManyToMany => "many-to-many",
        };
        f.write_str(s)
    }
}

/// Information about a link/join table for many-to-many relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"book_tags"`).
    pub table_name: &'static str,

    /// Column in link table pointing to the owner (e.g., `"book_id"`).
    pub local_column: &'static str,

    /// Column in link table pointing to the target (e.g., `"tag_id"`).
    pub remote_column: &'static str,

    /// Composite local key columns (for composite PK owners).
    ///
    /// If set, this takes precedence over `local_column`.
    pub local_columns: Option<&'static [&'static str]>,

    /// Composite remote key columns (for composite PK targets).
    ///
    /// If set, this takes precedence over `remote_column`.
    pub remote_columns: Option<&'static [&'static str]>,
}

impl LinkTableInfo {
    /// Create a new link-table definition.
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            local_column,
            remote_column,
            local_columns: None,
            remote_columns: None,
        }
    }

    /// Create a new composite link-table definition.
    ///
    /// Column order matters:
    /// - `local_columns` must match the owner PK value ordering
    /// - `remote_columns` must match the target PK value ordering
    #[must_use]
    pub const fn composite(
        table_name: &'static str,
        local_columns: &'static [&'static str],
        remote_columns: &'static [&'static str],
    ) -> Self {
        Self {
            table_name,
            local_column: "",
            remote_column: "",
            local_columns: Some(local_columns),
            remote_columns: Some(remote_columns),
        }
    }

    /// Return the local key columns (single or composite).
    #[must_use]
    pub fn local_cols(&self) -> &[&'static str] {
        if let Some(cols) = self.local_columns {
            return cols;
        }
        if self.local_column.is_empty() {
            return &[];
        }
        std::slice::from_ref(&self.local_column)
    }

    /// Return the remote key columns (single or composite).
    #[must_use]
    pub fn remote_cols(&self) -> &[&'static str] {
        if let Some(cols) = self.remote_columns {
            return cols;
        }
        if self.remote_column.is_empty() {
            return &[];
        }
        std::slice::from_ref(&self.remote_column)
    }
}

/// Parsed cascade options of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cascade {
    /// Related objects reached from a saved object are saved too.
    pub save_update: bool,
    /// Related objects of a deleted object are deleted.
    pub delete: bool,
    /// Objects removed from the collection are deleted.
    pub delete_orphan: bool,
}

impl Cascade {
    /// No cascades at all.
    pub const NONE: Cascade = Cascade {
        save_update: false,
        delete: false,
        delete_orphan: false,
    };

    /// Parse a comma-separated cascade string such as `"all, delete-orphan"`.
    ///
    /// `merge`, `expunge` and `refresh-expire` are accepted and ignored.
    pub fn parse(opts: &str) -> Result<Self> {
        let mut cascade = Cascade::NONE;
        for token in opts.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "all" => {
                    cascade.save_update = true;
                    cascade.delete = true;
                }
                "save-update" => cascade.save_update = true,
                "delete" => cascade.delete = true,
                "delete-orphan" => cascade.delete_orphan = true,
                "none" => {}
                "merge" | "expunge" | "refresh-expire" => {}
                other => {
                    return Err(Error::config(format!(
                        "unknown cascade option '{}' in '{}'",
                        other, opts
                    )));
                }
            }
        }
        Ok(cascade)
    }
}

impl Default for Cascade {
    fn default() -> Self {
        Cascade {
            save_update: true,
            delete: false,
            delete_orphan: false,
        }
    }
}

/// Metadata about a relationship from an owner entity to a target entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    /// Name of the relationship attribute on the owner.
    pub name: &'static str,

    /// The related entity's name.
    pub target: &'static str,

    /// Kind of relationship.
    pub kind: RelationshipKind,

    /// Local foreign key column (for ManyToOne).
    /// e.g., `"author_id"` on `Book`.
    pub local_key: Option<&'static str>,

    /// Composite local foreign key columns (for ManyToOne).
    ///
    /// If set, this takes precedence over `local_key`.
    pub local_keys: Option<&'static [&'static str]>,

    /// Remote foreign key column (for OneToMany / OneToOne).
    /// e.g., `"author_id"` on `Book` when accessed from `Author`.
    pub remote_key: Option<&'static str>,

    /// Composite remote foreign key columns (for OneToMany / OneToOne).
    ///
    /// If set, this takes precedence over `remote_key`.
    pub remote_keys: Option<&'static [&'static str]>,

    /// Link table for ManyToMany relationships.
    pub link_table: Option<LinkTableInfo>,

    /// Full cascade options string (e.g., "all, delete-orphan").
    ///
    /// `None` means `save-update`.
    pub cascade: Option<&'static str>,

    /// Write the foreign key with a separate UPDATE after both rows exist.
    pub post_update: bool,
}

impl RelationshipInfo {
    /// Create a new relationship with required fields.
    #[must_use]
    pub const fn new(name: &'static str, target: &'static str, kind: RelationshipKind) -> Self {
        Self {
            name,
            target,
            kind,
            local_key: None,
            local_keys: None,
            remote_key: None,
            remote_keys: None,
            link_table: None,
            cascade: None,
            post_update: false,
        }
    }

    /// Return the local key columns for this relationship (empty slice if unset).
    #[must_use]
    pub fn local_key_cols(&self) -> &[&'static str] {
        if let Some(keys) = self.local_keys {
            return keys;
        }
        match &self.local_key {
            Some(key) => std::slice::from_ref(key),
            None => &[],
        }
    }

    /// Return the remote key columns for this relationship (empty slice if unset).
    #[must_use]
    pub fn remote_key_cols(&self) -> &[&'static str] {
        if let Some(keys) = self.remote_keys {
            return keys;
        }
        match &self.remote_key {
            Some(key) => std::slice::from_ref(key),
            None => &[],
        }
    }

    /// The foreign key columns implementing this relationship, on whichever
    /// side holds them. Empty for many-to-many.
    #[must_use]
    pub fn fk_cols(&self) -> &[&'static str] {
        match self.kind {
            RelationshipKind::ManyToOne => self.local_key_cols(),
            RelationshipKind::OneToMany | RelationshipKind::OneToOne => self.remote_key_cols(),
            RelationshipKind::ManyToMany => &[],
        }
    }

    /// Parsed cascade options.
    pub fn cascade_options(&self) -> Result<Cascade> {
        match self.cascade {
            Some(opts) => Cascade::parse(opts),
            None => Ok(Cascade::default()),
        }
    }

    /// Set the local foreign key column (ManyToOne).
    #[must_use]
    pub const fn local_key(mut self, key: &'static str) -> Self {
        self.local_key = Some(key);
        self.local_keys = None;
        self
    }

    /// Set composite local foreign key columns (ManyToOne).
    ///
    /// The column order must match the target primary key value ordering.
    #[must_use]
    pub const fn local_keys(mut self, keys: &'static [&'static str]) -> Self {
        self.local_keys = Some(keys);
        self.local_key = None;
        self
    }

    /// Set the remote foreign key column (OneToMany / OneToOne).
    #[must_use]
    pub const fn remote_key(mut self, key: &'static str) -> Self {
        self.remote_key = Some(key);
        self.remote_keys = None;
        self
    }

    /// Set composite remote foreign key columns (OneToMany / OneToOne).
    ///
    /// The column order must match the owner primary key value ordering.
    #[must_use]
    pub const fn remote_keys(mut self, keys: &'static [&'static str]) -> Self {
        self.remote_keys = Some(keys);
        self.remote_key = None;
        self
    }

    /// Set the link table metadata (ManyToMany).
    #[must_use]
    pub const fn link_table(mut self, info: LinkTableInfo) -> Self {
        self.link_table = Some(info);
        self
    }

    /// Set full cascade options string.
    #[must_use]
    pub const fn cascade(mut self, opts: &'static str) -> Self {
        self.cascade = Some(opts);
        self
    }

    /// Enable/disable post-update foreign key writes.
    #[must_use]
    pub const fn post_update(mut self, value: bool) -> Self {
        self.post_update = value;
        self
    }
}
