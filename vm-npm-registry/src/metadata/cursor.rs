//! Scoped lazy sequences of package roots.
//!
//! A [`PackageRootCursor`] owns whatever produces its roots (a parse task over
//! a registry-root document, a walk over store names, several member cursors)
//! and releases it when closed. Dropping a cursor closes it, so early
//! abandonment and error paths release the underlying stream too.

use super::model::PackageRoot;
use crate::AppResult;
use async_trait::async_trait;
use std::collections::HashSet;

/// Producer behind a cursor.
#[async_trait]
pub trait PackageRootSource: Send {
    /// Next root, or `None` once the sequence is exhausted.
    async fn next_root(&mut self) -> AppResult<Option<PackageRoot>>;
}

/// Finite lazy sequence of package roots that must be closed after use.
pub struct PackageRootCursor {
    source: Option<Box<dyn PackageRootSource>>,
}

impl PackageRootCursor {
    pub fn new<S: PackageRootSource + 'static>(source: S) -> Self {
        Self {
            source: Some(Box::new(source)),
        }
    }

    /// A cursor that yields nothing.
    pub fn empty() -> Self {
        Self { source: None }
    }

    /// A cursor over roots already in memory.
    pub fn from_roots(roots: Vec<PackageRoot>) -> Self {
        Self::new(VecSource(roots.into_iter()))
    }

    /// Members in order, skipping any name an earlier member already yielded.
    pub fn chain_distinct(cursors: Vec<PackageRootCursor>) -> Self {
        Self::new(DistinctChain {
            cursors: cursors.into_iter().collect(),
            seen: HashSet::new(),
        })
    }

    /// Apply `f` to every root as it is pulled.
    pub fn map<F>(self, f: F) -> Self
    where
        F: Fn(PackageRoot) -> PackageRoot + Send + 'static,
    {
        Self::new(MapSource { inner: self, f })
    }

    /// Advance the cursor. Exhaustion and errors close it.
    pub async fn next(&mut self) -> AppResult<Option<PackageRoot>> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        match source.next_root().await {
            Ok(Some(root)) => Ok(Some(root)),
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Release the underlying source. Idempotent.
    pub fn close(&mut self) {
        if self.source.take().is_some() {
            tracing::trace!("Package root cursor closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }
}

impl Drop for PackageRootCursor {
    fn drop(&mut self) {
        self.close();
    }
}

struct VecSource(std::vec::IntoIter<PackageRoot>);

#[async_trait]
impl PackageRootSource for VecSource {
    async fn next_root(&mut self) -> AppResult<Option<PackageRoot>> {
        Ok(self.0.next())
    }
}

struct MapSource<F> {
    inner: PackageRootCursor,
    f: F,
}

#[async_trait]
impl<F> PackageRootSource for MapSource<F>
where
    F: Fn(PackageRoot) -> PackageRoot + Send,
{
    async fn next_root(&mut self) -> AppResult<Option<PackageRoot>> {
        Ok(self.inner.next().await?.map(&self.f))
    }
}

struct DistinctChain {
    cursors: std::collections::VecDeque<PackageRootCursor>,
    seen: HashSet<String>,
}

#[async_trait]
impl PackageRootSource for DistinctChain {
    async fn next_root(&mut self) -> AppResult<Option<PackageRoot>> {
        while let Some(current) = self.cursors.front_mut() {
            match current.next().await? {
                Some(root) => {
                    if self.seen.insert(root.name().to_string()) {
                        return Ok(Some(root));
                    }
                }
                None => {
                    self.cursors.pop_front();
                }
            }
        }
        Ok(None)
    }
}
