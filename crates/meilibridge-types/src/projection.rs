use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    Document,
    Pk,
};

/// A {source_field → dest_field} mapping (spec.md §3/§4.3). An empty
/// destination name means "keep unchanged"; a field absent from the map is
/// dropped; `None` is the identity projection (nil mapping keeps everything).
#[derive(Debug, Clone, Default)]
pub struct Projection(Option<BTreeMap<String, String>>);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProjectionError {
    #[error(
        "primary key `{pk}` is renamed to `{renamed_to}` by the field mapping; the primary key \
         must keep its own name"
    )]
    PrimaryKeyRenamed { pk: String, renamed_to: String },
}

impl Projection {
    pub fn new(mapping: BTreeMap<String, String>) -> Self {
        Self(Some(mapping))
    }

    pub fn identity() -> Self {
        Self(None)
    }

    /// Invariant P1: if the PK is named in the mapping and its mapped value
    /// is non-empty, it must equal the PK itself.
    pub fn validate(&self, pk: &Pk) -> Result<(), ProjectionError> {
        let Some(mapping) = &self.0 else {
            return Ok(());
        };
        if let Some(renamed_to) = mapping.get(pk.as_str()) {
            if !renamed_to.is_empty() && renamed_to != pk.as_str() {
                return Err(ProjectionError::PrimaryKeyRenamed {
                    pk: pk.as_str().to_string(),
                    renamed_to: renamed_to.clone(),
                });
            }
        }
        Ok(())
    }

    /// Applies the projection to a single document: drops every key not
    /// named by the mapping (as either a source or an already-renamed
    /// destination field), then renames non-empty destination entries.
    ///
    /// Keying the "keep" decision on destination names too, not just source
    /// names, is what makes this idempotent (R1): a document that already
    /// went through `apply` has destination-shaped field names, and a second
    /// pass must recognize them as still wanted rather than dropping them as
    /// unmapped.
    pub fn apply(&self, doc: Document) -> Document {
        let Some(mapping) = &self.0 else {
            return doc;
        };

        let mut out = Document::new();
        for (key, value) in doc {
            if let Some(dst) = mapping.get(&key) {
                let dst = if dst.is_empty() { key } else { dst.clone() };
                out.insert(dst, value);
            } else if mapping.values().any(|dst| dst == &key) {
                out.insert(key, value);
            }
        }
        out
    }

    /// Applies the projection to a batch, in place order.
    pub fn apply_batch(&self, docs: Vec<Document>) -> Vec<Document> {
        docs.into_iter().map(|d| self.apply(d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;
    use crate::Value;

    fn doc(pairs: &[(&str, &str)]) -> Document {
        let mut d = Document::new();
        for (k, v) in pairs {
            d.insert(*k, Value::String(v.to_string()));
        }
        d
    }

    #[test]
    fn drops_unmapped_fields_and_renames_mapped_ones() {
        let projection = Projection::new(btreemap! {
            "_id".to_string() => "".to_string(),
            "name".to_string() => "first_name".to_string(),
            "last_name".to_string() => "".to_string(),
            "age".to_string() => "".to_string(),
        });

        let input = doc(&[
            ("_id", "o1"),
            ("name", "foo1"),
            ("last_name", "bar"),
            ("age", "30"),
            ("secret", "x"),
        ]);

        let out = projection.apply(input);
        assert!(out.get("secret").is_none());
        assert!(out.get("name").is_none());
        assert_eq!(out.get("first_name"), Some(&Value::String("foo1".to_string())));
        assert_eq!(out.get("_id"), Some(&Value::String("o1".to_string())));
        assert_eq!(out.get("last_name"), Some(&Value::String("bar".to_string())));
    }

    #[test]
    fn identity_projection_keeps_everything() {
        let projection = Projection::identity();
        let input = doc(&[("a", "1"), ("b", "2")]);
        let out = projection.apply(input.clone());
        assert_eq!(out, input);
    }

    #[test]
    fn projection_is_idempotent() {
        // R1: project(project(doc, M), M) == project(doc, M)
        let projection = Projection::new(btreemap! {
            "_id".to_string() => "".to_string(),
            "name".to_string() => "first_name".to_string(),
        });
        let input = doc(&[("_id", "o1"), ("name", "foo1")]);
        let once = projection.apply(input.clone());
        let twice = projection.apply(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn validate_rejects_renamed_primary_key() {
        let projection = Projection::new(btreemap! {
            "_id".to_string() => "uuid".to_string(),
        });
        let err = projection.validate(&Pk::from("_id")).unwrap_err();
        assert_eq!(
            err,
            ProjectionError::PrimaryKeyRenamed {
                pk: "_id".to_string(),
                renamed_to: "uuid".to_string(),
            }
        );
    }

    #[test]
    fn validate_accepts_primary_key_kept_or_absent() {
        let kept = Projection::new(btreemap! { "_id".to_string() => "".to_string() });
        assert!(kept.validate(&Pk::from("_id")).is_ok());

        let absent = Projection::new(btreemap! { "name".to_string() => "".to_string() });
        assert!(absent.validate(&Pk::from("_id")).is_ok());
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            failure_persistence: None, ..ProptestConfig::default()
        })]

        /// R1: project(project(doc, M), M) == project(doc, M), for arbitrary
        /// fields and an arbitrary rename mapping over a shared key universe.
        #[test]
        fn projection_is_idempotent_over_arbitrary_inputs(
            doc_fields in prop::collection::vec(("[a-e]", any::<i64>()), 0..6),
            mapping_entries in prop::collection::vec(("[a-e]", "|renamed"), 0..6),
        ) {
            let mut input = Document::new();
            for (k, v) in doc_fields {
                input.insert(k, Value::Int(v));
            }

            let mapping = mapping_entries.into_iter().collect();
            let projection = Projection::new(mapping);

            let once = projection.apply(input.clone());
            let twice = projection.apply(once.clone());
            prop_assert_eq!(once, twice);
        }
    }
}
