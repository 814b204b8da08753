use std::sync::Arc;

#[cfg(any(test, feature = "testing"))]
use common::pause::PauseClient;
use common::{
    knobs::SEARCH_INDEX_SIZE_SOFT_LIMIT,
    persistence::PersistenceReader,
    runtime::Runtime,
};
use search::searcher::SegmentTermMetadataFetcher;
use storage::Storage;

use crate::{
    index_workers::{
        search_flusher::{
            SearchFlusher,
            SearchIndexLimits,
        },
        writer::SearchIndexMetadataWriter,
    },
    text_index_worker::text_meta::{
        BuildTextIndexArgs,
        TextIndexConfigParser,
        TextSearchIndex,
    },
    Database,
};

#[allow(dead_code)]
#[cfg(any(test, feature = "testing"))]
pub async fn backfill_text_indexes<RT: Runtime>(
    runtime: RT,
    database: Database<RT>,
    reader: Arc<dyn PersistenceReader>,
    storage: Arc<dyn Storage>,
    segment_term_metadata_fetcher: Arc<dyn SegmentTermMetadataFetcher>,
) -> anyhow::Result<()> {
    let writer = SearchIndexMetadataWriter::new(runtime.clone(), database.clone(), storage.clone());
    let mut flusher = FlusherBuilder::new(
        runtime,
        database,
        reader,
        storage,
        segment_term_metadata_fetcher,
        writer,
    )
    .set_soft_limit(0)
    .build();
    flusher.step().await?;
    Ok(())
}

pub(crate) struct FlusherBuilder<RT: Runtime> {
    runtime: RT,
    database: Database<RT>,
    reader: Arc<dyn PersistenceReader>,
    storage: Arc<dyn Storage>,
    segment_term_metadata_fetcher: Arc<dyn SegmentTermMetadataFetcher>,
    limits: SearchIndexLimits,
    writer: SearchIndexMetadataWriter<RT, TextSearchIndex>,
    #[cfg(any(test, feature = "testing"))]
    pause_client: Option<PauseClient>,
}

impl<RT: Runtime> FlusherBuilder<RT> {
    pub(crate) fn new(
        runtime: RT,
        database: Database<RT>,
        reader: Arc<dyn PersistenceReader>,
        storage: Arc<dyn Storage>,
        segment_term_metadata_fetcher: Arc<dyn SegmentTermMetadataFetcher>,
        writer: SearchIndexMetadataWriter<RT, TextSearchIndex>,
    ) -> Self {
        Self {
            runtime,
            database,
            reader,
            storage,
            segment_term_metadata_fetcher,
            writer,
            limits: SearchIndexLimits {
                index_size_soft_limit: *SEARCH_INDEX_SIZE_SOFT_LIMIT,
                incremental_multipart_threshold_bytes: *SEARCH_INDEX_SIZE_SOFT_LIMIT,
            },
            #[cfg(any(test, feature = "testing"))]
            pause_client: None,
        }
    }

    #[allow(dead_code)]
    pub fn set_soft_limit(self, limit: usize) -> Self {
        Self {
            limits: SearchIndexLimits {
                index_size_soft_limit: limit,
                ..self.limits
            },
            ..self
        }
    }

    #[allow(dead_code)]
    pub fn set_incremental_multipart_threshold_bytes(self, limit: usize) -> Self {
        Self {
            limits: SearchIndexLimits {
                incremental_multipart_threshold_bytes: limit,
                ..self.limits
            },
            ..self
        }
    }

    pub(crate) fn build(self) -> TextIndexFlusher2<RT> {
        SearchFlusher::new(
            self.runtime,
            self.database,
            self.reader,
            self.storage.clone(),
            self.limits,
            self.writer,
            BuildTextIndexArgs {
                search_storage: self.storage.clone(),
                segment_term_metadata_fetcher: self.segment_term_metadata_fetcher.clone(),
            },
            #[cfg(any(test, feature = "testing"))]
            self.pause_client,
        )
    }
}

pub type TextIndexFlusher2<RT> = SearchFlusher<RT, TextIndexConfigParser>;

pub(crate) fn new_text_flusher<RT: Runtime>(
    runtime: RT,
    database: Database<RT>,
    reader: Arc<dyn PersistenceReader>,
    storage: Arc<dyn Storage>,
    segment_metadata_fetcher: Arc<dyn SegmentTermMetadataFetcher>,
    writer: SearchIndexMetadataWriter<RT, TextSearchIndex>,
) -> TextIndexFlusher2<RT> {
    FlusherBuilder::new(
        runtime,
        database,
        reader,
        storage,
        segment_metadata_fetcher,
        writer,
    )
    .build()
}
