/// A logical source identifier: either a bare collection/table name, or a
/// `name:view` pair naming both the collection that change events arrive on
/// and the server-side view/join used for reads (spec.md §3, invariant I6).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CollectionRef {
    Bare(String),
    WithView { collection: String, view: String },
}

impl CollectionRef {
    /// Parses a raw `index_map` key. A string containing exactly one `:`
    /// splits into `(collection, view)`; zero or more-than-one colons yield a
    /// bare reference (invariant I6: `"a:b:c"` has `HasView = false`).
    pub fn parse(raw: &str) -> Self {
        if raw.matches(':').count() == 1 {
            let (collection, view) = raw.split_once(':').expect("exactly one ':' present");
            CollectionRef::WithView {
                collection: collection.to_string(),
                view: view.to_string(),
            }
        } else {
            CollectionRef::Bare(raw.to_string())
        }
    }

    pub fn has_view(&self) -> bool {
        matches!(self, CollectionRef::WithView { .. })
    }

    /// The name change events are received on ("watch name" in spec.md §4.5).
    pub fn watch_name(&self) -> &str {
        match self {
            CollectionRef::Bare(name) => name,
            CollectionRef::WithView { collection, .. } => collection,
        }
    }

    /// The name used for reads and projections ("read name" in spec.md
    /// §4.4/§4.5): the view if present, else the bare collection.
    pub fn read_name(&self) -> &str {
        match self {
            CollectionRef::Bare(name) => name,
            CollectionRef::WithView { view, .. } => view,
        }
    }

    /// Mirrors the original's `GetCollectionAndView`: `("", "")` unless this
    /// reference actually has a view.
    pub fn collection_and_view(&self) -> (&str, &str) {
        match self {
            CollectionRef::Bare(_) => ("", ""),
            CollectionRef::WithView { collection, view } => (collection, view),
        }
    }
}

impl std::fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectionRef::Bare(name) => f.write_str(name),
            CollectionRef::WithView { collection, view } => write!(f, "{collection}:{view}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_names() {
        assert_eq!(CollectionRef::parse("singleitem"), CollectionRef::Bare("singleitem".to_string()));
    }

    #[test]
    fn parses_collection_and_view() {
        assert_eq!(
            CollectionRef::parse("collection:view"),
            CollectionRef::WithView {
                collection: "collection".to_string(),
                view: "view".to_string(),
            }
        );
    }

    #[test]
    fn trailing_and_leading_colon_forms() {
        assert_eq!(
            CollectionRef::parse("justcollection:"),
            CollectionRef::WithView {
                collection: "justcollection".to_string(),
                view: "".to_string(),
            }
        );
        assert_eq!(
            CollectionRef::parse(":justview"),
            CollectionRef::WithView {
                collection: "".to_string(),
                view: "justview".to_string(),
            }
        );
    }

    #[test]
    fn more_than_one_colon_has_no_view() {
        let parsed = CollectionRef::parse("no:view:here");
        assert!(!parsed.has_view());
        assert_eq!(parsed.collection_and_view(), ("", ""));
    }

    #[test]
    fn bare_reference_has_no_view_and_empty_collection_and_view() {
        let parsed = CollectionRef::parse("singleitem");
        assert!(!parsed.has_view());
        assert_eq!(parsed.collection_and_view(), ("", ""));
    }

    #[test]
    fn read_and_watch_names() {
        let with_view = CollectionRef::parse("events:events_with_users");
        assert_eq!(with_view.watch_name(), "events");
        assert_eq!(with_view.read_name(), "events_with_users");

        let bare = CollectionRef::parse("events");
        assert_eq!(bare.watch_name(), "events");
        assert_eq!(bare.read_name(), "events");
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            failure_persistence: None, ..ProptestConfig::default()
        })]

        /// I6: a name with exactly one `:` always parses to `WithView`, and
        /// `collection_and_view` recovers the two halves exactly.
        #[test]
        fn single_colon_always_has_view(collection in "[a-zA-Z0-9_]{0,8}", view in "[a-zA-Z0-9_]{0,8}") {
            let raw = format!("{collection}:{view}");
            let parsed = CollectionRef::parse(&raw);
            prop_assert!(parsed.has_view());
            prop_assert_eq!(parsed.collection_and_view(), (collection.as_str(), view.as_str()));
        }

        /// A name with no `:` at all never has a view.
        #[test]
        fn colon_free_names_never_have_view(name in "[a-zA-Z0-9_]{1,12}") {
            prop_assert!(!CollectionRef::parse(&name).has_view());
        }
    }
}
