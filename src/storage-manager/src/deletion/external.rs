use async_trait::async_trait;

/// Answers whether a study can be retrieved from an external archive.
#[async_trait]
pub trait ExternalRetrieveChecker: std::fmt::Debug + Send + Sync + 'static {
    /// True if `study_iuid` is complete and online at the archive `aet`.
    async fn is_retrievable(&self, aet: &str, study_iuid: &str) -> anyhow::Result<bool>;
}

/// Used when no external archive is connected: nothing is retrievable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExternalArchive;

#[async_trait]
impl ExternalRetrieveChecker for NoExternalArchive {
    async fn is_retrievable(&self, _aet: &str, _study_iuid: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}
