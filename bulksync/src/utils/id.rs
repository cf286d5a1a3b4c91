use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

pub fn uuid_v5(ns: Uuid, name: &str) -> Uuid {
    Uuid::new_v5(&ns, name.as_bytes())
}

/// Qualified name of the readme owned by `owner_qn`; one readme per owner.
pub fn readme_qualified_name(owner_qn: &str) -> String {
    format!("{owner_qn}/readme")
}

/// Qualified name of a link owned by `owner_qn`, stable across runs for the same url.
pub fn link_qualified_name(owner_qn: &str, url: &str) -> String {
    // name 形如 "owner-qn|url"
    let name = format!("{owner_qn}|{url}");
    format!("{owner_qn}/link/{}", uuid_v5(Uuid::NAMESPACE_URL, &name))
}

/// Hands out negative placeholder guids for entities submitted in one pass.
#[derive(Debug)]
pub struct PlaceholderIds {
    next: AtomicI64,
}

impl Default for PlaceholderIds {
    fn default() -> Self {
        Self {
            next: AtomicI64::new(-1),
        }
    }
}

impl PlaceholderIds {
    pub fn next(&self) -> String {
        self.next.fetch_sub(1, Ordering::Relaxed).to_string()
    }
}
