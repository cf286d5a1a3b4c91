use std::sync::Arc;

use bulksync::config::UpsertMode;
use bulksync::kinds::{ANCHOR, ASSET, PARENT_CATEGORY, README, README_CONTENT};
use bulksync::models::{Entity, Value};
use bulksync::utils::id::readme_qualified_name;
use tempfile::tempdir;

mod common;
mod support;

use common::{bulk_sync, test_config, write_file};
use support::catalog::MemoryCatalog;

const GLOSSARY_FILE: &str = "typeName,qualifiedName,name,anchor,parentCategory\n\
    GlossaryCategory,cat-quarterly,Quarterly,Sales,Finance@@@Sales\n\
    GlossaryCategory,cat-finance,Finance,Sales,\n\
    Glossary,gloss-sales,Sales,,\n";

#[tokio::test]
async fn test_same_file_hierarchy_creates_then_updates() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = write_file(dir.path(), "glossary.csv", GLOSSARY_FILE);
    let catalog = Arc::new(MemoryCatalog::new());

    let first = bulk_sync(test_config(), catalog.clone()).import(&path).await?;
    assert_eq!(first.created(), 3);
    assert_eq!(first.updated(), 0);
    assert!(!first.has_failures(), "{:?}", first.failure_buckets());

    let glossary = catalog.get("Glossary", "gloss-sales").expect("glossary created");
    let finance = catalog.get("GlossaryCategory", "cat-finance").expect("category created");
    let quarterly = catalog.get("GlossaryCategory", "cat-quarterly").expect("sub-category created");
    assert_eq!(finance.ref_guid(ANCHOR), glossary.guid.as_deref());
    assert_eq!(quarterly.ref_guid(PARENT_CATEGORY), finance.guid.as_deref());

    // A fresh run against the same catalog only updates.
    let second = bulk_sync(test_config(), catalog.clone()).import(&path).await?;
    assert_eq!(second.created(), 0);
    assert_eq!(second.updated(), 3);
    for (type_name, qn) in [
        ("Glossary", "gloss-sales"),
        ("GlossaryCategory", "cat-finance"),
        ("GlossaryCategory", "cat-quarterly"),
    ] {
        assert_eq!(catalog.creations(type_name, qn), 1, "{type_name}@{qn}");
    }
    Ok(())
}

#[tokio::test]
async fn test_terms_and_assets_resolve_across_passes() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = write_file(
        dir.path(),
        "mixed.csv",
        "typeName,qualifiedName,name,anchor,categories,assignedTerms\n\
         Table,default/pg/orders,orders,,,Revenue@@@Sales\n\
         GlossaryTerm,term-revenue,Revenue,Sales,Finance@@@Sales,\n\
         GlossaryCategory,cat-finance,Finance,Sales,,\n\
         Glossary,gloss-sales,Sales,,,\n",
    );
    let catalog = Arc::new(MemoryCatalog::new());

    let results = bulk_sync(test_config(), catalog.clone()).import(&path).await?;
    assert_eq!(results.created(), 4);
    assert!(!results.has_failures(), "{:?}", results.failure_buckets());

    let term = catalog.get("GlossaryTerm", "term-revenue").expect("term created");
    let table = catalog.get("Table", "default/pg/orders").expect("table created");
    let assigned = table.attribute("assignedTerms").expect("terms assigned");
    let guids: Vec<_> = assigned.refs().iter().filter_map(|r| r.guid.clone()).collect();
    assert_eq!(guids, vec![term.guid.clone().unwrap()]);
    Ok(())
}

#[tokio::test]
async fn test_repeated_key_is_created_at_most_once() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut contents = String::from("typeName,qualifiedName,description\n");
    for i in 0..8 {
        contents.push_str(&format!("Table,default/pg/orders,revision {i}\n"));
    }
    let path = write_file(dir.path(), "repeated.csv", &contents);
    let catalog = Arc::new(MemoryCatalog::new());
    let mut config = test_config();
    config.batch_size = 1;
    config.parallelism = Some(4);

    let results = bulk_sync(config, catalog.clone()).import(&path).await?;
    assert_eq!(catalog.creations("Table", "default/pg/orders"), 1);
    assert_eq!(results.created(), 1);
    assert!(!results.has_failures());
    Ok(())
}

#[tokio::test]
async fn test_related_entities_follow_their_owner() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = write_file(
        dir.path(),
        "readmes.csv",
        "typeName,qualifiedName,name,readme\n\
         Table,default/pg/known,known,Known table docs\n\
         Table,default/pg/unknown,unknown,Never stored\n",
    );
    let catalog = Arc::new(MemoryCatalog::new());
    let known_guid = catalog.seed(
        Entity::new("Table", "default/pg/known")
            .with_attribute("name", Value::Text("known".into())),
    );
    let mut config = test_config();
    config.upsert_mode = UpsertMode::UpdateOnly;

    let results = bulk_sync(config, catalog.clone()).import(&path).await?;
    assert_eq!(results.updated(), 1);
    assert_eq!(results.skipped(), 1);

    let readme = catalog
        .get(README, &readme_qualified_name("default/pg/known"))
        .expect("readme of the stored table");
    assert_eq!(readme.ref_guid(ASSET), Some(known_guid.as_str()));
    assert_eq!(
        readme.attribute(README_CONTENT).and_then(Value::as_text),
        Some("Known table docs")
    );
    assert!(catalog.get(README, &readme_qualified_name("default/pg/unknown")).is_none());

    let assets = results.passes.last().expect("assets pass");
    assert_eq!(assets.related.skipped.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_blank_related_cell_clears_when_overwritten() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let with_readme = write_file(
        dir.path(),
        "with.csv",
        "typeName,qualifiedName,readme\nTable,default/pg/orders,Orders docs\n",
    );
    let without_readme = write_file(
        dir.path(),
        "without.csv",
        "typeName,qualifiedName,readme\nTable,default/pg/orders,\n",
    );
    let catalog = Arc::new(MemoryCatalog::new());
    bulk_sync(test_config(), catalog.clone()).import(&with_readme).await?;
    assert_eq!(catalog.all_of_type(README).len(), 1);

    let mut config = test_config();
    config.attributes_to_overwrite = vec!["readme".to_string()];
    let results = bulk_sync(config, catalog.clone()).import(&without_readme).await?;
    let removed: usize = results.passes.iter().map(|p| p.related_removed).sum();
    assert_eq!(removed, 1);
    Ok(())
}

#[tokio::test]
async fn test_unsupported_column_fails_row_only() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = write_file(
        dir.path(),
        "unsupported.csv",
        "typeName,qualifiedName,name,rowCount\n\
         Table,default/pg/orders,orders,10\n\
         Column,default/pg/orders/id,id,42\n",
    );
    let catalog = Arc::new(MemoryCatalog::new());

    let results = bulk_sync(test_config(), catalog.clone()).import(&path).await?;
    assert_eq!(results.created(), 1);
    let buckets = results.failure_buckets();
    assert_eq!(buckets["unsupported field"].len(), 1);
    assert!(results.has_failures());
    Ok(())
}

#[tokio::test]
async fn test_terms_may_reference_terms_of_the_same_file() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = write_file(
        dir.path(),
        "terms.csv",
        "typeName,qualifiedName,name,anchor,seeAlso\n\
         Glossary,gloss-sales,Sales,,\n\
         GlossaryTerm,t-rev,Revenue,Sales,Profit@@@Sales\n\
         GlossaryTerm,t-profit,Profit,Sales,\n",
    );
    let catalog = Arc::new(MemoryCatalog::new());

    let results = bulk_sync(test_config(), catalog.clone()).import(&path).await?;
    assert_eq!(results.created(), 3);
    assert!(!results.has_failures(), "{:?}", results.failure_buckets());

    let revenue = catalog.get("GlossaryTerm", "t-rev").expect("referencing term stored");
    let profit = catalog.get("GlossaryTerm", "t-profit").expect("referenced term stored");
    let see_also: Vec<_> = revenue
        .attribute("seeAlso")
        .expect("seeAlso applied after the term flush")
        .refs()
        .iter()
        .filter_map(|r| r.guid.clone())
        .collect();
    assert_eq!(see_also, vec![profit.guid.clone().unwrap()]);
    assert_eq!(catalog.creations("GlossaryTerm", "t-rev"), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_row_counts_its_related_work() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = write_file(
        dir.path(),
        "invalid.csv",
        "typeName,qualifiedName,certificateStatus,readme\n\
         Table,default/pg/orders,MAYBE,Orders docs\n",
    );
    let catalog = Arc::new(MemoryCatalog::new());

    let results = bulk_sync(test_config(), catalog.clone()).import(&path).await?;
    let assets = results.passes.last().expect("assets pass");
    assert_eq!(assets.primary.failed(), 1);
    assert_eq!(
        assets.related.skipped,
        vec![bulksync::models::EntityKey::new(README, readme_qualified_name("default/pg/orders"))]
    );
    assert!(catalog.all_of_type(README).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_rows_without_identity_are_reported() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = write_file(
        dir.path(),
        "blank.csv",
        "typeName,qualifiedName,name\nTable,,orders\n,default/pg/users,users\n",
    );
    let catalog = Arc::new(MemoryCatalog::new());

    let results = bulk_sync(test_config(), catalog.clone()).import(&path).await?;
    assert_eq!(results.created(), 0);
    assert_eq!(results.failed(), 2);
    assert!(results.has_failures());
    assert_eq!(results.failure_buckets()["invalid value"].len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_missing_required_column_is_fatal() {
    let dir = tempdir().unwrap();
    let path = write_file(dir.path(), "bad.csv", "typeName,name\nTable,orders\n");
    let catalog = Arc::new(MemoryCatalog::new());
    let result = bulk_sync(test_config(), catalog).import(&path).await;
    assert!(matches!(
        result,
        Err(bulksync::errors::SyncError::Schema { .. })
    ));
}
