//! Schema-tolerant accessors over the raw admitted object.
//!
//! The API server hands us whatever the client submitted, so nothing here
//! fails: every lookup returns `None` when a field is absent or has the wrong
//! shape, and callers decide what absence means.

use serde_json::{Map, Value};

pub const INJECTION_ANNOTATION: &str = "proxy-injection";

/// Value of the `proxy-injection` annotation, translated once at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InjectionSetting {
    Enabled,
    Disabled,
    #[default]
    Unset,
}

impl InjectionSetting {
    /// Unknown values do not opt out.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None => InjectionSetting::Unset,
            Some(x) if x.eq_ignore_ascii_case("disabled") => InjectionSetting::Disabled,
            Some(x) if x.eq_ignore_ascii_case("enabled") => InjectionSetting::Enabled,
            Some(_) => InjectionSetting::Unset,
        }
    }

    fn from_annotations(annotations: Option<&Map<String, Value>>) -> Self {
        Self::parse(
            annotations
                .and_then(|x| x.get(INJECTION_ANNOTATION))
                .and_then(Value::as_str),
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PodView<'a> {
    raw: &'a Value,
}

impl<'a> PodView<'a> {
    pub fn new(raw: &'a Value) -> Self {
        PodView { raw }
    }

    pub fn metadata(&self) -> Option<&'a Map<String, Value>> {
        self.raw.get("metadata").and_then(Value::as_object)
    }

    pub fn name(&self) -> Option<&'a str> {
        let metadata = self.metadata()?;
        metadata
            .get("name")
            .or_else(|| metadata.get("generateName"))
            .and_then(Value::as_str)
    }

    /// Namespace name, whether given as a plain string or an embedded object.
    pub fn namespace(&self) -> Option<&'a str> {
        match self.metadata()?.get("namespace")? {
            Value::String(x) => Some(x.as_str()),
            Value::Object(x) => x.get("name").and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn annotations(&self) -> Option<&'a Map<String, Value>> {
        self.metadata()?
            .get("annotations")
            .and_then(Value::as_object)
    }

    /// Namespace metadata embedded in the object under `metadata.namespace`.
    pub fn embedded_namespace(&self) -> Option<NamespaceView<'a>> {
        self.metadata()?
            .get("namespace")
            .filter(|x| x.is_object())
            .map(NamespaceView::new)
    }

    pub fn injection_setting(&self) -> InjectionSetting {
        InjectionSetting::from_annotations(self.annotations())
    }

    pub fn containers(&self) -> Option<&'a Vec<Value>> {
        self.spec_array("containers")
    }

    pub fn init_containers(&self) -> Option<&'a Vec<Value>> {
        self.spec_array("initContainers")
    }

    /// Names of all regular and init containers; unnamed entries are skipped.
    pub fn container_names(&self) -> impl Iterator<Item = &'a str> {
        self.containers()
            .into_iter()
            .chain(self.init_containers())
            .flatten()
            .filter_map(|x| x.get("name").and_then(Value::as_str))
    }

    fn spec_array(&self, key: &str) -> Option<&'a Vec<Value>> {
        self.raw.get("spec")?.get(key).and_then(Value::as_array)
    }
}

/// Accessor over a Namespace object (or anything shaped like one).
#[derive(Debug, Clone, Copy)]
pub struct NamespaceView<'a> {
    raw: &'a Value,
}

impl<'a> NamespaceView<'a> {
    pub fn new(raw: &'a Value) -> Self {
        NamespaceView { raw }
    }

    /// Annotations live under `metadata` on a real Namespace, but an embedded
    /// namespace may carry them at the top level.
    pub fn annotations(&self) -> Option<&'a Map<String, Value>> {
        self.raw
            .get("metadata")
            .and_then(|x| x.get("annotations"))
            .and_then(Value::as_object)
            .or_else(|| self.raw.get("annotations").and_then(Value::as_object))
    }

    pub fn injection_setting(&self) -> InjectionSetting {
        InjectionSetting::from_annotations(self.annotations())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_setting() {
        assert_eq!(InjectionSetting::parse(None), InjectionSetting::Unset);
        assert_eq!(
            InjectionSetting::parse(Some("disabled")),
            InjectionSetting::Disabled
        );
        assert_eq!(
            InjectionSetting::parse(Some(" Disabled ")),
            InjectionSetting::Disabled
        );
        assert_eq!(
            InjectionSetting::parse(Some("enabled")),
            InjectionSetting::Enabled
        );
        assert_eq!(InjectionSetting::parse(Some("off")), InjectionSetting::Unset);
    }

    #[test]
    fn missing_everything() {
        let raw = json!({});
        let pod = PodView::new(&raw);
        assert!(pod.metadata().is_none());
        assert!(pod.containers().is_none());
        assert!(pod.embedded_namespace().is_none());
        assert_eq!(pod.container_names().count(), 0);
        assert_eq!(pod.injection_setting(), InjectionSetting::Unset);
    }

    #[test]
    fn wrong_shapes_are_absent() {
        let raw = json!({
            "metadata": {"annotations": ["proxy-injection"], "namespace": 7},
            "spec": {"containers": {"name": "app"}},
        });
        let pod = PodView::new(&raw);
        assert!(pod.annotations().is_none());
        assert!(pod.namespace().is_none());
        assert!(pod.containers().is_none());
        assert_eq!(pod.injection_setting(), InjectionSetting::Unset);
    }

    #[test]
    fn container_names_span_init_containers() {
        let raw = json!({
            "spec": {
                "containers": [{"name": "app"}, {"image": "nameless"}],
                "initContainers": [{"name": "setup"}],
            }
        });
        let names: Vec<_> = PodView::new(&raw).container_names().collect();
        assert_eq!(names, vec!["app", "setup"]);
    }

    #[test]
    fn embedded_namespace() {
        let raw = json!({
            "metadata": {
                "name": "web",
                "namespace": {"name": "shop", "annotations": {"proxy-injection": "disabled"}},
            }
        });
        let pod = PodView::new(&raw);
        assert_eq!(pod.name(), Some("web"));
        assert_eq!(pod.namespace(), Some("shop"));
        assert_eq!(
            pod.embedded_namespace().unwrap().injection_setting(),
            InjectionSetting::Disabled
        );

        let raw = json!({"metadata": {"namespace": "shop"}});
        let pod = PodView::new(&raw);
        assert_eq!(pod.namespace(), Some("shop"));
        assert!(pod.embedded_namespace().is_none());
    }

    #[test]
    fn namespace_annotations_fall_back_past_wrong_shapes() {
        let raw = json!({
            "metadata": {"annotations": "proxy-injection=disabled"},
            "annotations": {"proxy-injection": "disabled"},
        });
        assert_eq!(
            NamespaceView::new(&raw).injection_setting(),
            InjectionSetting::Disabled
        );

        let raw = json!({"metadata": {"annotations": []}});
        assert!(NamespaceView::new(&raw).annotations().is_none());
    }

    #[test]
    fn namespace_object_annotations() {
        let raw = json!({"metadata": {"annotations": {"proxy-injection": "disabled"}}});
        assert_eq!(
            NamespaceView::new(&raw).injection_setting(),
            InjectionSetting::Disabled
        );
    }
}
