use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query as TantivyQuery, QueryParser, TermQuery};
use tantivy::schema::*;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, Term};
use uuid::Uuid;

use crate::error::SearchError;
use crate::models::{Candidate, ChunkRecord, OwnerScope};
use crate::search::{LexicalSearch, RetrievalOptions, RetrievalOutput};

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Minimum number of raw hits pulled from tantivy before post-filtering.
const MIN_FETCH: usize = 50;

/// BM25 search index built on tantivy.
///
/// Cheap to clone; clones share the underlying index, reader and writer lock.
#[derive(Clone)]
pub struct Bm25Index {
    index: Index,
    reader: IndexReader,
    writer_lock: Arc<Mutex<()>>,
    // Field handles
    f_chunk_id: Field,
    f_document_id: Field,
    f_owner: Field,
    f_content: Field,
    f_meta: Field,
    f_element_type: Field,
    f_page: Field,
}

impl Bm25Index {
    /// Create or open a BM25 index at the given directory.
    pub fn open_or_create(index_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(index_dir)?;
        let schema = build_schema();

        let index = if index_dir.join("meta.json").exists() {
            Index::open_in_dir(index_dir).context("Failed to open existing tantivy index")?
        } else {
            Index::create_in_dir(index_dir, schema.clone())
                .context("Failed to create tantivy index")?
        };
        Self::from_index(index)
    }

    /// Index held entirely in RAM.
    pub fn in_memory() -> Result<Self> {
        Self::from_index(Index::create_in_ram(build_schema()))
    }

    fn from_index(index: Index) -> Result<Self> {
        let schema = index.schema();
        let field = |name: &str| {
            schema
                .get_field(name)
                .with_context(|| format!("Index schema is missing field `{name}`"))
        };
        let f_chunk_id = field("chunk_id")?;
        let f_document_id = field("document_id")?;
        let f_owner = field("owner")?;
        let f_content = field("content")?;
        let f_meta = field("meta")?;
        let f_element_type = field("element_type")?;
        let f_page = field("page")?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .context("Failed to create reader")?;

        Ok(Self {
            index,
            reader,
            writer_lock: Arc::new(Mutex::new(())),
            f_chunk_id,
            f_document_id,
            f_owner,
            f_content,
            f_meta,
            f_element_type,
            f_page,
        })
    }

    /// Index a batch of chunks. Chunks already present (same chunk id) are replaced.
    pub fn index_chunks(&self, chunks: &[ChunkRecord]) -> Result<()> {
        let _guard = self.writer_lock.lock();
        let mut writer: IndexWriter = self
            .index
            .writer(WRITER_HEAP_BYTES)
            .context("Failed to create index writer")?;

        for chunk in chunks {
            let chunk_id = chunk.chunk_id.to_string();
            writer.delete_term(Term::from_field_text(self.f_chunk_id, &chunk_id));
            let mut document = doc!(
                self.f_chunk_id => chunk_id,
                self.f_document_id => chunk.document_id.to_string(),
                self.f_owner => chunk.owner_id.clone(),
                self.f_content => chunk.content.clone(),
                self.f_meta => serde_json::to_string(chunk)?,
            );
            // Filter fields are only written when present so `Must` clauses exclude
            // chunks without them
            if let Some(element_type) = &chunk.element_type {
                document.add_text(self.f_element_type, element_type.to_lowercase());
            }
            if let Some(page) = chunk.page_number {
                document.add_text(self.f_page, page.to_string());
            }
            writer.add_document(document)?;
        }

        writer.commit().context("Failed to commit index")?;
        self.reader.reload().context("Failed to reload reader")?;
        Ok(())
    }

    /// Delete all chunks for a given document.
    pub fn delete_document(&self, document_id: &Uuid) -> Result<()> {
        let _guard = self.writer_lock.lock();
        let mut writer: IndexWriter = self
            .index
            .writer(WRITER_HEAP_BYTES)
            .context("Failed to create index writer")?;

        let term = Term::from_field_text(self.f_document_id, &document_id.to_string());
        writer.delete_term(term);
        writer.commit().context("Failed to commit delete")?;
        self.reader.reload().context("Failed to reload reader")?;
        Ok(())
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Search the index for one owner.
    ///
    /// Raw BM25 scores are unbounded, so they are squashed into 0-1 with
    /// `s / (s + 1)` before the threshold is applied.
    pub fn search_blocking(
        &self,
        query_str: &str,
        owner: &OwnerScope,
        options: &RetrievalOptions,
    ) -> Result<(Vec<Candidate>, usize)> {
        let searcher = self.reader.searcher();

        let query_parser = QueryParser::for_index(&self.index, vec![self.f_content]);
        // Free text from users routinely contains syntax tantivy would reject
        let (text_query, _errors) = query_parser.parse_query_lenient(query_str);

        let mut clauses: Vec<(Occur, Box<dyn TantivyQuery>)> = vec![
            (Occur::Must, text_query),
            (
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.f_owner, owner.as_str()),
                    IndexRecordOption::Basic,
                )),
            ),
        ];
        if let Some(ids) = &options.document_ids {
            let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
            clauses.push((Occur::Must, any_of(self.f_document_id, &ids)));
        }
        if let Some(types) = &options.element_types {
            let types: Vec<String> = types.iter().map(|t| t.to_lowercase()).collect();
            clauses.push((Occur::Must, any_of(self.f_element_type, &types)));
        }
        if let Some(pages) = &options.page_numbers {
            let pages: Vec<String> = pages.iter().map(u32::to_string).collect();
            clauses.push((Occur::Must, any_of(self.f_page, &pages)));
        }
        let query = BooleanQuery::new(clauses);

        let fetch = (options.limit * 4).max(MIN_FETCH);
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(fetch))
            .context("Search failed")?;

        let mut hits = Vec::new();
        for (raw_score, doc_address) in top_docs {
            let score = raw_score / (raw_score + 1.0);
            if !score.is_finite() || score < options.threshold {
                continue;
            }

            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .context("Failed to retrieve document")?;
            let Some(meta) = doc.get_first(self.f_meta).and_then(|v| v.as_str()) else {
                continue;
            };
            let chunk: ChunkRecord = match serde_json::from_str(meta) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Skipping unreadable chunk metadata in lexical index: {e}");
                    continue;
                }
            };

            if options.admits(owner, &chunk) {
                hits.push(Candidate::from_lexical(&chunk, score));
            }
        }

        let total = hits.len();
        hits.truncate(options.limit);
        Ok((hits, total))
    }
}

/// Disjunction of exact-term matches on a STRING field. An empty list matches nothing.
fn any_of(field: Field, values: &[String]) -> Box<dyn TantivyQuery> {
    let terms: Vec<(Occur, Box<dyn TantivyQuery>)> = values
        .iter()
        .map(|v| {
            let q: Box<dyn TantivyQuery> = Box::new(TermQuery::new(
                Term::from_field_text(field, v),
                IndexRecordOption::Basic,
            ));
            (Occur::Should, q)
        })
        .collect();
    Box::new(BooleanQuery::new(terms))
}

fn build_schema() -> Schema {
    let mut schema_builder = Schema::builder();
    schema_builder.add_text_field("chunk_id", STRING | STORED);
    schema_builder.add_text_field("document_id", STRING | STORED);
    schema_builder.add_text_field("owner", STRING);
    schema_builder.add_text_field("content", TEXT);
    schema_builder.add_text_field("meta", STORED);
    schema_builder.add_text_field("element_type", STRING);
    schema_builder.add_text_field("page", STRING);
    schema_builder.build()
}

#[async_trait]
impl LexicalSearch for Bm25Index {
    async fn search(
        &self,
        query: &str,
        owner: &OwnerScope,
        options: &RetrievalOptions,
    ) -> crate::error::Result<RetrievalOutput> {
        let start = Instant::now();
        let index = self.clone();
        let query = query.to_string();
        let owner = owner.clone();
        let options = options.clone();

        let (results, total_results) =
            tokio::task::spawn_blocking(move || index.search_blocking(&query, &owner, &options))
                .await
                .map_err(|e| SearchError::internal(format!("Lexical search task failed: {e}")))?
                .map_err(|e| SearchError::unavailable("lexical", e))?;

        Ok(RetrievalOutput {
            results,
            total_results,
            search_time_ms: start.elapsed().as_millis() as u64,
            cache_hit: false,
        })
    }
}
