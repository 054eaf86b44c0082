//! The pre-registered server specifications.
//!
//! Exact membership is a deployment detail: the HTTP adapter connects these
//! by name without the caller supplying a command line. None auto-start. Per
//! -server API keys are read from the ambient environment at construction and
//! land in the spec's env overlay, so rotating a key only needs a restart.

use crate::{ServerName, ServerSpec};

fn name(literal: &str) -> ServerName {
    ServerName::parse(literal).expect("default server names are valid")
}

/// Copies `key` from the ambient environment into the spec's overlay when
/// set; servers without their key still register, they just fail on use.
fn with_env_passthrough(spec: ServerSpec, key: &str) -> ServerSpec {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => spec.with_env(key, value),
        _ => spec,
    }
}

pub(crate) fn default_specs() -> Vec<ServerSpec> {
    vec![
        ServerSpec::new(name("filesystem"), "npx")
            .with_args(["-y", "@modelcontextprotocol/server-filesystem", "/tmp"])
            .with_description("Local filesystem access (scoped to /tmp)"),
        with_env_passthrough(
            ServerSpec::new(name("nodit"), "npx")
                .with_args(["-y", "@noditlabs/nodit-mcp-server"])
                .with_description("Nodit multi-chain blockchain data APIs"),
            "NODIT_API_KEY",
        ),
        with_env_passthrough(
            ServerSpec::new(name("etherscan"), "npx")
                .with_args(["-y", "@mcpdotdirect/etherscan-mcp-server"])
                .with_description("Etherscan contract and transaction analytics"),
            "ETHERSCAN_API_KEY",
        ),
        with_env_passthrough(
            ServerSpec::new(name("dune"), "npx")
                .with_args(["-y", "@duneanalytics/mcp-server"])
                .with_description("Dune Analytics query execution"),
            "DUNE_API_KEY",
        ),
        ServerSpec::new(name("memory"), "npx")
            .with_args(["-y", "@modelcontextprotocol/server-memory"])
            .with_description("Ephemeral knowledge-graph memory"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unique_and_never_auto_start() {
        let specs = default_specs();
        let mut names: Vec<_> = specs.iter().map(|spec| spec.name.as_str()).collect();
        names.sort_unstable();
        let len_before = names.len();
        names.dedup();
        assert_eq!(names.len(), len_before, "duplicate default server name");
        assert!(specs.iter().all(|spec| !spec.auto_start));
    }
}
