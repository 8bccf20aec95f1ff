use std::collections::HashMap;

use tscache_model::ScalarType;

/// Schema lookup used when a column's type cannot be read off its values,
/// typically because the series came back without rows.
pub trait FieldTypes {
    fn field_type(&self, measurement: &str, field: &str) -> Option<ScalarType>;
}

impl<T: FieldTypes + ?Sized> FieldTypes for &T {
    fn field_type(&self, measurement: &str, field: &str) -> Option<ScalarType> {
        (**self).field_type(measurement, field)
    }
}

/// Infer from values only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSchema;

impl FieldTypes for NoSchema {
    fn field_type(&self, _measurement: &str, _field: &str) -> Option<ScalarType> {
        None
    }
}

/// Fixed per-measurement field types.
#[derive(Debug, Clone, Default)]
pub struct StaticSchema {
    fields: HashMap<(String, String), ScalarType>,
}

impl StaticSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(
        mut self,
        measurement: impl Into<String>,
        field: impl Into<String>,
        ty: ScalarType,
    ) -> Self {
        self.fields.insert((measurement.into(), field.into()), ty);
        self
    }
}

impl FieldTypes for StaticSchema {
    fn field_type(&self, measurement: &str, field: &str) -> Option<ScalarType> {
        self.fields
            .get(&(measurement.to_string(), field.to_string()))
            .copied()
    }
}
