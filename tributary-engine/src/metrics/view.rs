/// Selects instruments by name and customizes the stream they produce.
///
/// The selector is either an exact instrument name or `*` for every
/// instrument. When several views match, the first one registered wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    instrument: String,
    name: Option<String>,
    description: Option<String>,
}

impl View {
    pub fn new(instrument: impl Into<String>) -> View {
        View {
            instrument: instrument.into(),
            name: None,
            description: None,
        }
    }

    /// Exports the stream under a different name. Ignored for `*` selectors,
    /// since every instrument would end up with the same name.
    pub fn with_name(mut self, name: impl Into<String>) -> View {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> View {
        self.description = Some(description.into());
        self
    }

    pub(crate) fn matches(&self, instrument: &str) -> bool {
        self.instrument == "*" || self.instrument == instrument
    }

    /// The stream name and description to use for a matching instrument.
    pub(crate) fn apply(&self, name: &str, description: &str) -> (String, String) {
        let name = match &self.name {
            Some(rename) if self.instrument != "*" => rename.clone(),
            _ => name.to_owned(),
        };
        let description = self
            .description
            .clone()
            .unwrap_or_else(|| description.to_owned());

        (name, description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_selector_renames() {
        let view = View::new("http.requests").with_name("requests");

        assert!(view.matches("http.requests"));
        assert!(!view.matches("http.errors"));
        assert_eq!(
            view.apply("http.requests", "desc"),
            ("requests".to_owned(), "desc".to_owned())
        );
    }

    #[test]
    fn wildcard_selector_keeps_names() {
        let view = View::new("*").with_name("ignored").with_description("all");

        assert!(view.matches("anything"));
        assert_eq!(
            view.apply("anything", ""),
            ("anything".to_owned(), "all".to_owned())
        );
    }
}
