use gator::{FetchError, Payload, Record, RepositoryDescriptor, ResolveError};

/// Where records live inside a JSON document and how each is keyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// JSON pointer to the records array; empty means the document root.
    pub pointer: String,
    pub key_field: String,
}

impl Default for Extraction {
    fn default() -> Self {
        Self {
            pointer: String::new(),
            key_field: "id".to_owned(),
        }
    }
}

impl Extraction {
    /// Read `pointer` and `key_field` from a descriptor's params.
    pub fn from_descriptor(descriptor: &RepositoryDescriptor) -> Result<Self, ResolveError> {
        let mut extraction = Self::default();

        if let Some(pointer) = descriptor.param_str("pointer")? {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(ResolveError::invalid_params(
                    descriptor,
                    "`pointer` must be empty or start with `/`",
                ));
            }
            extraction.pointer = pointer.to_owned();
        }

        if let Some(key_field) = descriptor.param_str("key_field")? {
            if key_field.is_empty() {
                return Err(ResolveError::invalid_params(
                    descriptor,
                    "`key_field` must not be empty",
                ));
            }
            extraction.key_field = key_field.to_owned();
        }

        Ok(extraction)
    }

    /// Turn the array at the pointer into records.
    pub fn records(&self, document: &Payload) -> Result<Vec<Record>, FetchError> {
        let items = document
            .pointer(&self.pointer)
            .ok_or_else(|| FetchError::Parse(format!("nothing at pointer `{}`", self.pointer)))?
            .as_array()
            .ok_or_else(|| {
                FetchError::Parse(format!("value at pointer `{}` is not an array", self.pointer))
            })?;

        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let key = match item.get(&self.key_field) {
                    Some(Payload::String(s)) if !s.is_empty() => s.clone(),
                    Some(Payload::Number(n)) => n.to_string(),
                    _ => {
                        return Err(FetchError::Parse(format!(
                            "record #{index} has no usable `{}` field",
                            self.key_field
                        )));
                    }
                };
                Ok(Record::new(key, item.clone()))
            })
            .collect()
    }
}
