//! Lazy enumeration over paged listings.

use crate::backends::{BackendResult, StorageBackend};
use crate::models::{listing::ListQuery, object::ObjectAttrs};
use futures::{Stream, TryStreamExt, stream};
use std::sync::Arc;

/// `None` once the last page has been fetched; otherwise the token to send.
type PageState = Option<Option<String>>;
type PageItems = stream::Iter<std::vec::IntoIter<BackendResult<ObjectAttrs>>>;

/// Stream every entry matching `query`, fetching pages on demand until the
/// backend stops returning a continuation token.
///
/// The stream is finite and cannot be restarted; call again to re-issue the
/// listing from the first page. A failed page ends the stream with that error.
pub fn object_stream(
    backend: Arc<dyn StorageBackend>,
    bucket: impl Into<String>,
    query: ListQuery,
) -> impl Stream<Item = BackendResult<ObjectAttrs>> + Send + 'static {
    let bucket = bucket.into();
    let first: PageState = Some(query.page_token.clone());
    stream::try_unfold(first, move |state| {
        fetch_page(backend.clone(), bucket.clone(), query.clone(), state)
    })
    .try_flatten()
}

async fn fetch_page(
    backend: Arc<dyn StorageBackend>,
    bucket: String,
    mut query: ListQuery,
    state: PageState,
) -> BackendResult<Option<(PageItems, PageState)>> {
    let Some(page_token) = state else {
        return Ok(None);
    };
    query.page_token = page_token;

    let page = backend.list_objects(&bucket, &query).await?;
    let next: PageState = page.next_page_token.map(Some);
    let items: Vec<BackendResult<ObjectAttrs>> = page.items.into_iter().map(Ok).collect();
    Ok(Some((stream::iter(items), next)))
}
