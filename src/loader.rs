use std::path::Path;

use crate::model::Workflow;

/// Loads a workflow definition from a YAML file, mirroring the shape of a typical flow
/// loader: read the file, parse it, hand back the typed value for the host to register
/// with an `Engine`. Not part of the core engine contract — a convenience for callers who
/// want a file-backed workflow without writing their own loader.
pub fn load_workflow_yaml(path: impl AsRef<Path>) -> anyhow::Result<Workflow> {
    let raw = std::fs::read_to_string(path)?;
    let workflow: Workflow = serde_yaml::from_str(&raw)?;
    Ok(workflow)
}

pub fn load_workflow_json(path: impl AsRef<Path>) -> anyhow::Result<Workflow> {
    let raw = std::fs::read_to_string(path)?;
    let workflow: Workflow = serde_json::from_str(&raw)?;
    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_valid_yaml_workflow() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
id: wf-1
name: demo
steps:
  - id: a
    depends_on: []
  - id: b
    depends_on: [a]
"#
        )
        .unwrap();

        let workflow = load_workflow_yaml(file.path()).unwrap();
        assert_eq!(workflow.id, "wf-1");
        assert_eq!(workflow.steps.len(), 2);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_workflow_yaml("/nonexistent/path/flow.yaml").is_err());
    }
}
