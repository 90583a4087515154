//! Dependency resolution
//!
//! Expands a derived view into the transitive set of base relations it
//! reads from, recursing through intermediate views and stopping at base
//! tables. Relations reachable through multiple paths appear once. A
//! reference cycle is not a supported schema shape but terminates anyway
//! thanks to the visited set.


use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;

use tracing::trace;

use crate::errors::Result;
use crate::errors::SetupError;
use crate::row::ObjectKind;
use crate::row::RelationId;
use crate::store::SchemaCatalog;

pub struct DependencyResolver {
    catalog: Arc<dyn SchemaCatalog>,
}

impl DependencyResolver {
    pub fn new(catalog: Arc<dyn SchemaCatalog>) -> Self {
        Self { catalog }
    }

    /// Base relations the object identified by `root` transitively reads
    /// from, in deterministic order.
    pub async fn resolve(&self, root: &RelationId) -> Result<BTreeSet<RelationId>> {
        let mut bases = BTreeSet::new();
        let mut visited: HashSet<RelationId> = HashSet::new();
        let mut pending = vec![root.clone()];

        while let Some(object) = pending.pop() {
            if !visited.insert(object.clone()) {
                continue;
            }
            let references = self.catalog.get_references(&object).await.map_err(|source| {
                SetupError::DependencyResolution {
                    relation: object.clone(),
                    source,
                }
            })?;
            for (referenced, kind) in references {
                match kind {
                    ObjectKind::BaseTable => {
                        bases.insert(referenced);
                    }
                    ObjectKind::View => {
                        if !visited.contains(&referenced) {
                            pending.push(referenced);
                        }
                    }
                }
            }
        }

        trace!("{root} depends on {} base relation(s)", bases.len());
        Ok(bases)
    }
}
