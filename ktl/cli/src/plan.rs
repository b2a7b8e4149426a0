//! Loads a stack plan file into the `(Run, Vec<RunNode>)` pair the Stack
//! Runner expects. The plan file format is a thin, `ktl`-native YAML
//! document; kubeconfig/Helm chart resolution is external-collaborator
//! territory (`spec.md` §2) and is not this crate's concern.

use std::path::Path;

use ktl_protocol::domain::{
    NodeId, NodeStatus, ParallelismGroup, Run, RunCommand, RunId, RunNode, WorkloadKind,
};
use serde::Deserialize;

use crate::error::CliError;

#[derive(Debug, Deserialize)]
pub struct PlanFile {
    pub cluster: String,
    pub namespace: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    pub releases: Vec<PlanRelease>,
}

#[derive(Debug, Deserialize)]
pub struct PlanRelease {
    pub name: String,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub parallelism_group: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub input_hash: Option<String>,
}

pub fn load(path: &Path) -> Result<PlanFile, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::PlanRead {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| CliError::PlanParse {
        path: path.display().to_string(),
        source,
    })
}

/// Builds the `Run`/`RunNode` pair the orchestrator consumes, resolving
/// each release name against `cluster/namespace` into a fully-qualified
/// [`NodeId`].
pub fn build_run(
    plan: &PlanFile,
    command: RunCommand,
    stack_root: &Path,
    concurrency: usize,
    fail_mode: ktl_protocol::domain::FailMode,
) -> (Run, Vec<RunNode>) {
    let run = Run {
        id: RunId::from_timestamp(chrono::Utc::now()),
        command,
        stack_root: stack_root.display().to_string(),
        profile: plan.profile.clone(),
        concurrency,
        fail_mode,
        selector: plan.selector.clone(),
    };

    let nodes = plan
        .releases
        .iter()
        .map(|release| RunNode {
            id: NodeId::new(&plan.cluster, &plan.namespace, &release.name),
            needs: release
                .needs
                .iter()
                .map(|name| NodeId::new(&plan.cluster, &plan.namespace, name))
                .collect(),
            parallelism_group: release.parallelism_group.clone().map(ParallelismGroup),
            primary_kind: release.kind.clone().map(WorkloadKind),
            critical: release.critical,
            attempt: 0,
            input_hash: release.input_hash.clone().unwrap_or_default(),
            status: NodeStatus::Planned,
            execution_group: 0,
        })
        .collect();

    (run, nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktl_protocol::domain::FailMode;
    use std::io::Write;

    fn sample_plan() -> PlanFile {
        PlanFile {
            cluster: "prod".into(),
            namespace: "payments".into(),
            profile: None,
            selector: None,
            releases: vec![
                PlanRelease {
                    name: "db".into(),
                    needs: Vec::new(),
                    parallelism_group: None,
                    kind: Some("statefulset".into()),
                    critical: true,
                    input_hash: Some("h1".into()),
                },
                PlanRelease {
                    name: "api".into(),
                    needs: vec!["db".into()],
                    parallelism_group: Some("backend".into()),
                    kind: None,
                    critical: false,
                    input_hash: None,
                },
            ],
        }
    }

    #[test]
    fn build_run_resolves_needs_into_fully_qualified_node_ids() {
        let plan = sample_plan();
        let (run, nodes) = build_run(&plan, RunCommand::Apply, Path::new("."), 4, FailMode::FailFast);

        assert_eq!(run.concurrency, 4);
        assert_eq!(nodes.len(), 2);

        let api = nodes.iter().find(|n| n.id.0.ends_with("/api")).unwrap();
        assert_eq!(api.needs, vec![NodeId::new("prod", "payments", "db")]);
        assert_eq!(
            api.parallelism_group,
            Some(ParallelismGroup("backend".into()))
        );

        let db = nodes.iter().find(|n| n.id.0.ends_with("/db")).unwrap();
        assert!(db.critical);
        assert_eq!(db.input_hash, "h1");
    }

    #[test]
    fn build_run_defaults_missing_input_hash_to_empty_string() {
        let plan = sample_plan();
        let (_, nodes) = build_run(&plan, RunCommand::Delete, Path::new("."), 1, FailMode::Continue);
        let api = nodes.iter().find(|n| n.id.0.ends_with("/api")).unwrap();
        assert_eq!(api.input_hash, "");
    }

    #[test]
    fn load_parses_a_yaml_plan_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "cluster: prod\nnamespace: payments\nreleases:\n  - name: db\n    critical: true\n"
        )
        .unwrap();

        let plan = load(file.path()).expect("valid plan parses");
        assert_eq!(plan.cluster, "prod");
        assert_eq!(plan.releases.len(), 1);
        assert!(plan.releases[0].critical);
    }

    #[test]
    fn load_reports_a_plan_read_error_for_a_missing_file() {
        let err = load(Path::new("/nonexistent/plan.yaml")).unwrap_err();
        assert!(matches!(err, CliError::PlanRead { .. }));
    }
}
