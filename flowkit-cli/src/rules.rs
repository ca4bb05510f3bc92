// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use flowkit::common::{rule::StaticRuleSet, session::Endpoint};
use std::path::PathBuf;

/// Loads a rule file and logs the decision for each endpoint
pub fn rules_main(path: PathBuf, endpoints: Vec<String>) -> Result<()> {
  let rules = StaticRuleSet::from_json_file(&path)
    .with_context(|| format!("Failed loading rules from {}", path.display()))?;
  tracing::info!(
    path = %path.display(),
    rules = rules.rules.len(),
    default = ?rules.default,
    "rule file is valid"
  );
  for raw in endpoints {
    let endpoint = raw
      .parse::<Endpoint>()
      .with_context(|| format!("Invalid endpoint {}", raw))?;
    let destination = rules.match_endpoint(&endpoint);
    tracing::info!(%endpoint, ?destination, "matched");
  }
  Ok(())
}
