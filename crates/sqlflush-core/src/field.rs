//! Field and column definitions.

/// Metadata about a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Database column name
    pub name: &'static str,
    /// Whether this column is nullable
    pub nullable: bool,
    /// Whether this is a primary key column
    pub primary_key: bool,
    /// Whether the backend generates this column's value on insert
    pub auto_increment: bool,
    /// Foreign key reference (table.column), informational only
    pub foreign_key: Option<&'static str>,
}

impl FieldInfo {
    /// Create a new non-null, non-key column.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            foreign_key: None,
        }
    }

    /// Set nullable flag.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set primary key flag.
    ///
    /// Primary key columns are never nullable.
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        if value {
            self.nullable = false;
        }
        self
    }

    /// Set auto-increment flag.
    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    /// Set foreign key reference.
    pub const fn foreign_key(mut self, reference: &'static str) -> Self {
        self.foreign_key = Some(reference);
        self
    }
}
