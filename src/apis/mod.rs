pub mod fluview;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::types::{RawRow, Region, WeekRange};

/// A provider of weekly surveillance rows.
#[async_trait]
pub trait SurveillanceSource: Send + Sync {
    /// Unique identifier for this source
    fn source_name(&self) -> &'static str;

    /// Fetch every row the provider has for `region` within `range`.
    /// An empty, well-formed response is `Ok(vec![])`.
    async fn fetch(&self, region: Region, range: WeekRange) -> Result<Vec<RawRow>, FetchError>;
}
