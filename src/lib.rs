pub mod core;
pub mod io;
pub mod schema;
pub mod analysis;
pub mod source;
pub mod indexer;
pub mod index;
pub mod query;
pub mod expr;
pub mod search;
pub mod sort;
pub mod server;
pub mod distributed;

/*
┌──────────────────────────────────────────────────────────────────────┐
│                          SIFT ARCHITECTURE                           │
└──────────────────────────────────────────────────────────────────────┘

  indexing                              querying
  ────────                              ────────
  DocumentSource                        client (sphinx / mysql41 wire)
      │ docs, attrs                         │ frames
      ▼                                     ▼
  Tokenizer ─ Dict                      server::client / server::mysql
      │ hits (wordid, docid, hitpos)        │ SearchQuery
      ▼                                     ▼
  indexer::HitArena                     query::QueryParser ─► QNode tree
      │ sorted runs                         │
      ▼                                     ▼
  indexer::MergeStream (loser tree)     search::ExtNode (posting walk)
      │ postings                            │ Match stream
      ▼                                     ▼
  indexer::SegmentEmitter               sort::TopN / GroupBy queues
      │                                     │
      ▼                                     ▼
  sph spa spi spd spp spm spk ◄──mmap── index::SearchIndex
                                            │
                                        distributed::Agent fan-out,
                                        merge, rotation, attr flush
*/
