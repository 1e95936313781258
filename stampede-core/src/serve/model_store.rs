use std::collections::HashMap;

/// Registry of trained models and the dataset each was trained against.
/// The dataset name decides how batch inputs are interpreted and
/// validated when batches are handed to workers.
#[derive(Debug, Default)]
pub struct ModelStore {
    models: HashMap<String, String>,
}

impl ModelStore {
    pub fn add_model(&mut self, model: impl Into<String>, dataset: impl Into<String>) {
        self.models.insert(model.into(), dataset.into());
    }

    pub fn contains(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    pub fn dataset_for(&self, model: &str) -> Option<&str> {
        self.models.get(model).map(String::as_str)
    }

    /// Snapshot for the coordinator backup.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.models
            .iter()
            .map(|(model, dataset)| (model.clone(), dataset.clone()))
            .collect()
    }

    pub fn replace_all(&mut self, entries: Vec<(String, String)>) {
        self.models = entries.into_iter().collect();
    }
}

/// Whether a dataset's manifest lines are store filenames the worker
/// must materialise before evaluation. Plain-text datasets (`.txt`)
/// carry raw model inputs inline; everything else is a file set.
pub fn dataset_expects_filenames(dataset: &str) -> bool {
    !dataset.ends_with(".txt")
}

/// Dataset-specific input validation applied when a batch is handed
/// out: file sets keep entries naming an actual file (an extension in
/// the last path component), raw-line sets keep non-blank lines.
pub fn validate_inputs(dataset: &str, inputs: Vec<String>) -> Vec<String> {
    if dataset_expects_filenames(dataset) {
        inputs
            .into_iter()
            .filter(|input| {
                input
                    .rsplit('/')
                    .next()
                    .is_some_and(|basename| basename.contains('.'))
            })
            .collect()
    } else {
        inputs
            .into_iter()
            .filter(|input| !input.trim().is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trip() {
        let mut store = ModelStore::default();
        store.add_model("resnet", "images");
        assert!(store.contains("resnet"));
        assert_eq!(store.dataset_for("resnet"), Some("images"));
        assert!(store.dataset_for("albert").is_none());

        let mut restored = ModelStore::default();
        restored.replace_all(store.entries());
        assert_eq!(restored.dataset_for("resnet"), Some("images"));
    }

    #[test]
    fn filename_datasets_require_extensions() {
        assert!(dataset_expects_filenames("images"));
        assert!(!dataset_expects_filenames("sentiment.txt"));

        let kept = validate_inputs(
            "images",
            vec![
                "images/cat.jpeg".to_string(),
                "images/no-extension".to_string(),
                "dog.png".to_string(),
            ],
        );
        assert_eq!(kept, vec!["images/cat.jpeg", "dog.png"]);
    }

    #[test]
    fn raw_datasets_drop_blank_lines() {
        let kept = validate_inputs(
            "sentiment.txt",
            vec!["good film;1".to_string(), "  ".to_string()],
        );
        assert_eq!(kept, vec!["good film;1"]);
    }
}
