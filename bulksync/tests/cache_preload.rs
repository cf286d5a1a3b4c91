use std::sync::Arc;
use std::time::Duration;

use bulksync::cache::Lookup;
use bulksync::config::ImportConfig;
use bulksync::kinds::{ANCHOR, CacheKind, PARENT_CATEGORY, PARENT_DOMAIN};
use bulksync::models::{Entity, EntityRef, Value};

mod common;
mod support;

use common::bulk_sync;
use support::catalog::MemoryCatalog;

fn named(type_name: &str, qn: &str, name: &str) -> Entity {
    Entity::new(type_name, qn).with_attribute("name", Value::Text(name.into()))
}

/// Seeds a glossary with a three-level category tree and a two-level domain tree.
fn seeded_catalog(delay: Duration) -> Arc<MemoryCatalog> {
    let catalog = Arc::new(MemoryCatalog::with_search_delay(delay));
    let glossary = catalog.seed(named("Glossary", "gloss-sales", "Sales"));
    let anchor = Value::Ref(EntityRef::by_guid("Glossary", &glossary));

    let mut parent = None;
    for (qn, name) in [("cat-1", "Finance"), ("cat-2", "Quarterly"), ("cat-3", "Q1")] {
        let mut category = named("GlossaryCategory", qn, name).with_attribute(ANCHOR, anchor.clone());
        if let Some(guid) = &parent {
            category = category.with_attribute(
                PARENT_CATEGORY,
                Value::Ref(EntityRef::by_guid("GlossaryCategory", guid)),
            );
        }
        parent = Some(catalog.seed(category));
    }
    // Siblings at every level give the parallel workers something to do.
    for i in 0..6 {
        catalog.seed(
            named("GlossaryCategory", &format!("cat-root-{i}"), &format!("Root {i}"))
                .with_attribute(ANCHOR, anchor.clone()),
        );
    }
    catalog.seed(
        named("GlossaryTerm", "term-revenue", "Revenue").with_attribute(ANCHOR, anchor.clone()),
    );

    let core = catalog.seed(named("DataDomain", "dom-core", "Core"));
    catalog.seed(
        named("DataDomain", "dom-billing", "Billing")
            .with_attribute(PARENT_DOMAIN, Value::Ref(EntityRef::by_guid("DataDomain", &core))),
    );
    catalog
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_level_preload_completes() -> anyhow::Result<()> {
    let catalog = seeded_catalog(Duration::from_millis(5));
    let config = ImportConfig {
        preload_caches: true,
        ..Default::default()
    };
    let sync = bulk_sync(config, catalog.clone());
    let caches = sync.importer.caches().clone();

    tokio::time::timeout(Duration::from_secs(10), caches.preload_all()).await??;

    let searches = catalog.searches();
    let categories = caches.cache(CacheKind::Category);
    assert_eq!(categories.len(), 9);
    let q1 = categories.get_by_identity("Finance@Quarterly@Q1@@@Sales").await?;
    assert!(q1.is_found());
    let term = caches.cache(CacheKind::Term).get_by_identity("Revenue@@@Sales").await?;
    assert!(term.is_found());
    let billing = caches.cache(CacheKind::Domain).get_by_identity("Core@Billing").await?;
    assert!(billing.is_found());
    // Everything came from the preload.
    assert_eq!(catalog.searches(), searches);
    Ok(())
}

#[tokio::test]
async fn test_lazy_lookup_walks_hierarchy() -> anyhow::Result<()> {
    let catalog = seeded_catalog(Duration::ZERO);
    let sync = bulk_sync(ImportConfig::default(), catalog.clone());
    let categories = sync.importer.caches().cache(CacheKind::Category);

    let found = categories.get_by_identity("Finance@Quarterly@@@Sales").await?;
    let entity = found.found().expect("sub-category resolved");
    assert_eq!(entity.qualified_name, "cat-2");

    let missing = categories.get_by_identity("Finance@Yearly@@@Sales").await?;
    assert_eq!(missing, Lookup::NotFound);
    let searches = catalog.searches();
    let again = categories.get_by_identity("Finance@Yearly@@@Sales").await?;
    assert_eq!(again, Lookup::NotFound);
    assert_eq!(catalog.searches(), searches);
    Ok(())
}
