//! Quality (CRF) search: range selection, output grammar and the searcher actor.

pub mod command;
pub mod parser;
mod searcher;

pub use command::{build_crf_search_args, CrfRange};
pub use parser::{parse_line, SearchEvent, SizeUnit, TimeUnit};
pub use searcher::{
    SearchError, SearchRequest, SearcherContext, SearcherHandle, SearcherStatus, StartOutcome,
};
