use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ExpansionConfig;
use crate::engine::{AddressAnalysis, Engine};
use crate::error::Result;
use crate::graph::types::Address;

#[derive(Debug, Clone, Serialize)]
pub struct ExpandedNode {
    pub depth: u32,
    pub analysis: AddressAnalysis,
    pub expanded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchError {
    pub address: Address,
    pub depth: u32,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpansionResult {
    pub seed: Address,
    pub nodes: Vec<ExpandedNode>,
    /// Parent to the children it was expanded into.
    pub expansion_map: BTreeMap<Address, Vec<Address>>,
    pub errors: Vec<BranchError>,
    pub cancelled: bool,
}

#[derive(Default)]
struct Tree {
    visited: HashSet<Address>,
    nodes: Vec<ExpandedNode>,
    expansion_map: BTreeMap<Address, Vec<Address>>,
    errors: Vec<BranchError>,
}

struct Ctx<'a> {
    engine: &'a Engine,
    params: &'a ExpansionConfig,
    cancel: &'a CancellationToken,
    tree: Mutex<Tree>,
}

/// Fully analyze `seed` and, while the full risk score clears `trigger_score`,
/// recurse depth-first into its strongest counterparties.
pub async fn expand(
    engine: &Engine,
    seed: &Address,
    params: &ExpansionConfig,
    cancel: &CancellationToken,
) -> Result<ExpansionResult> {
    let ctx = Ctx {
        engine,
        params,
        cancel,
        tree: Mutex::new(Tree::default()),
    };

    tracing::info!(
        address = %seed,
        trigger_score = params.trigger_score,
        expansion_depth = params.expansion_depth,
        "Auto-expansion started"
    );

    // A failed seed fails the whole expansion
    visit(&ctx, seed.clone(), 0).await?;

    let tree = ctx.tree.into_inner();
    tracing::info!(
        address = %seed,
        analyzed = tree.nodes.len(),
        errors = tree.errors.len(),
        "Auto-expansion finished"
    );

    Ok(ExpansionResult {
        seed: seed.clone(),
        nodes: tree.nodes,
        expansion_map: tree.expansion_map,
        errors: tree.errors,
        cancelled: cancel.is_cancelled(),
    })
}

fn visit<'a>(
    ctx: &'a Ctx<'a>,
    address: Address,
    depth: u32,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        if !ctx.tree.lock().await.visited.insert(address.clone()) {
            return Ok(());
        }

        let analysis = ctx.engine.analyze(&address, ctx.params.tx_limit).await?;
        let triggered = analysis.risk_score >= ctx.params.trigger_score;
        let expand = triggered && depth < ctx.params.expansion_depth;

        let children: Vec<Address> = if expand {
            ctx.engine
                .store
                .get_counterparties(
                    &address,
                    ctx.params.min_value,
                    ctx.params.max_addresses_per_expansion,
                )
                .await?
                .into_iter()
                .map(|cp| cp.address)
                .collect()
        } else {
            Vec::new()
        };

        {
            let mut tree = ctx.tree.lock().await;
            let fresh: Vec<Address> = children
                .iter()
                .filter(|c| !tree.visited.contains(*c))
                .cloned()
                .collect();
            if expand {
                tracing::info!(
                    address = %address,
                    depth,
                    risk_score = analysis.risk_score,
                    children = fresh.len(),
                    "Risk above trigger, expanding"
                );
                tree.expansion_map.insert(address.clone(), fresh);
            }
            tree.nodes.push(ExpandedNode {
                depth,
                analysis,
                expanded: expand,
            });
        }

        for child in children {
            if let Err(e) = visit(ctx, child.clone(), depth + 1).await {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::warn!(address = %child, depth = depth + 1, error = %e, "Expansion branch failed");
                ctx.tree.lock().await.errors.push(BranchError {
                    address: child,
                    depth: depth + 1,
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    })
}
