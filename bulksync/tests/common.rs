use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use bulksync::BulkSync;
use bulksync::config::ImportConfig;
use bulksync::service::CatalogService;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Writes `contents` to `dir/name` and returns the path.
#[allow(dead_code)]
pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write input file");
    path
}

/// A small, deterministic configuration: two chunks and tiny batches so that
/// every pass exercises parallel chunks and several upsert calls.
#[allow(dead_code)]
pub fn test_config() -> ImportConfig {
    ImportConfig {
        batch_size: 2,
        related_batch_size: 2,
        parallelism: Some(2),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn bulk_sync(config: ImportConfig, catalog: Arc<impl CatalogService + 'static>) -> BulkSync {
    init_logging();
    BulkSync::new(config, catalog).expect("valid configuration")
}
