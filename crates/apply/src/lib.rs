//! Keelson apply: turns a rendered bundle into resource descriptors and
//! prepares them for creation.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use keelson_core::{Error, ResourceDescriptor, Result};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, warn};

/// Documents lacking this token are not resources (comment-only, empty, notes).
pub const KIND_MARKER: &str = "kind:";

fn max_doc_bytes() -> usize {
    std::env::var("KEELSON_MAX_DOC_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1 << 20)
}

fn max_doc_nodes() -> usize {
    std::env::var("KEELSON_MAX_DOC_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// `---` alone, or followed by whitespace (`--- # Source: ...`, `--- !tag`).
fn is_separator(line: &str) -> bool {
    let l = line.trim_end();
    l.strip_prefix("---").is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
}

/// Raw documents of a bundle, split on `---` separator lines.
pub struct Documents<'a> {
    rest: Option<&'a str>,
}

pub fn documents(raw: &str) -> Documents<'_> {
    Documents { rest: Some(raw) }
}

impl<'a> Iterator for Documents<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let rest = self.rest?;
        let mut offset = 0usize;
        for line in rest.split_inclusive('\n') {
            if is_separator(line) {
                self.rest = Some(&rest[offset + line.len()..]);
                return Some(&rest[..offset]);
            }
            offset += line.len();
        }
        self.rest = None;
        Some(rest)
    }
}

/// Lazily decoded descriptors of a bundle, in document order. Documents that
/// fail to decode are logged and skipped.
pub struct Descriptors<'a> {
    docs: Documents<'a>,
    index: usize,
}

pub fn parse(raw: &str) -> Descriptors<'_> {
    Descriptors { docs: documents(raw), index: 0 }
}

pub fn parse_all(raw: &str) -> Vec<ResourceDescriptor> {
    parse(raw).collect()
}

impl Iterator for Descriptors<'_> {
    type Item = ResourceDescriptor;

    fn next(&mut self) -> Option<ResourceDescriptor> {
        for doc in self.docs.by_ref() {
            let index = self.index;
            self.index += 1;
            if !doc.contains(KIND_MARKER) {
                debug!(doc = index, "skipping document without kind marker");
                continue;
            }
            match decode_document(doc) {
                Ok(d) => {
                    counter!("bundle_descriptors_total", 1u64);
                    return Some(d);
                }
                Err(e) => {
                    counter!("bundle_decode_errors_total", 1u64);
                    warn!(doc = index, error = %e, "skipping undecodable document");
                }
            }
        }
        None
    }
}

/// Decode one YAML document into a descriptor.
pub fn decode_document(doc: &str) -> Result<ResourceDescriptor> {
    if doc.len() > max_doc_bytes() {
        return Err(Error::decode(format!("document too large (>{} bytes)", max_doc_bytes())));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(doc).map_err(|e| Error::decode(format!("parsing YAML: {}", e)))?;
    if val.is_null() {
        return Err(Error::decode("document is empty"));
    }
    let body = serde_json::to_value(val).map_err(|e| Error::decode(format!("converting YAML to JSON: {}", e)))?;
    if !body.is_object() {
        return Err(Error::decode("document is not a mapping"));
    }
    if json_node_budget_exceeded(&body, max_doc_nodes()) {
        return Err(Error::decode(format!("document too complex (>{} nodes)", max_doc_nodes())));
    }
    let api_version = body.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| Error::decode("missing apiVersion"))?.to_string();
    let kind = body.get("kind").and_then(|v| v.as_str()).ok_or_else(|| Error::decode("missing kind"))?.to_string();
    let meta = body.get("metadata");
    let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).ok_or_else(|| Error::decode("missing metadata.name"))?.to_string();
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).map(|s| s.to_string());
    Ok(ResourceDescriptor { kind, api_version, namespace, name, body })
}

/// Link a descriptor to its owning chart and force it into the release namespace.
pub fn prepare(descriptor: &mut ResourceDescriptor, owner: &OwnerReference, namespace: &str) -> Result<()> {
    descriptor.set_owner(owner)?;
    descriptor.set_namespace(namespace);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NGINX: &str = "---
# Source: nginx/templates/deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: nginx
  namespace: somewhere-else
spec:
  replicas: 2
---
# Source: nginx/templates/NOTES.txt
# nothing to see here
---
apiVersion: v1
kind: Service
metadata:
  name: nginx
spec:
  ports:
    - port: 80
";

    #[test]
    fn documents_split_on_separator_lines() {
        let docs: Vec<_> = documents("a: 1\n---\nb: 2\n--- # trailing\nc: 3").collect();
        assert_eq!(docs, vec!["a: 1\n", "b: 2\n", "c: 3"]);
        // separators must be whole lines
        let docs: Vec<_> = documents("text: a---b\n").collect();
        assert_eq!(docs.len(), 1);
        let docs: Vec<_> = documents("a: 1\n---\t\nb: 2\n--- !tagged\nc: 3\r\n---\r\nd: 4").collect();
        assert_eq!(docs, vec!["a: 1\n", "b: 2\n", "c: 3\r\n", "d: 4"]);
        // a dash run glued to text is content, not a separator
        let docs: Vec<_> = documents("a: 1\n----\n---x\n").collect();
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn parse_keeps_only_documents_with_marker() {
        let out = parse_all(NGINX);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, "Deployment");
        assert_eq!(out[0].api_version, "apps/v1");
        assert_eq!(out[0].namespace.as_deref(), Some("somewhere-else"));
        assert_eq!(out[0].body["spec"]["replicas"], 2);
        assert_eq!(out[1].kind, "Service");
        assert_eq!(out[1].namespace, None);
    }

    #[test]
    fn n_documents_with_m_markers_yield_m_descriptors() {
        let mut raw = String::new();
        let mut markers = 0;
        for i in 0..7 {
            if i > 0 {
                raw.push_str("---\n");
            }
            if i % 3 == 0 {
                raw.push_str("# comment only\n");
            } else {
                markers += 1;
                raw.push_str(&format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-{}\n", i));
            }
        }
        assert_eq!(documents(&raw).count(), 7);
        assert_eq!(parse(&raw).count(), markers);
    }

    #[test]
    fn undecodable_documents_are_skipped_not_fatal() {
        let raw = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ok-1\n---\nkind: [unclosed\n---\n# kind: commented out\n---\nkind: Secret\nmetadata:\n  name: no-api-version\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ok-2\n";
        let names: Vec<_> = parse(raw).map(|d| d.name).collect();
        assert_eq!(names, vec!["ok-1", "ok-2"]);
    }

    #[test]
    fn decode_errors_are_friendly() {
        let e1 = decode_document("kind: Foo\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e1.contains("missing apiVersion"), "e1={}", e1);
        let e2 = decode_document("apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e2.contains("missing kind"), "e2={}", e2);
        let e3 = decode_document("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap_err().to_string();
        assert!(e3.contains("missing metadata.name"), "e3={}", e3);
        let e4 = decode_document("# kind: nothing\n").unwrap_err().to_string();
        assert!(e4.contains("empty"), "e4={}", e4);
        let e5 = decode_document("- kind: a\n").unwrap_err().to_string();
        assert!(e5.contains("not a mapping"), "e5={}", e5);
    }

    #[test]
    fn prepare_forces_namespace_and_owner() {
        let mut d = parse_all(NGINX).remove(0);
        let owner = OwnerReference {
            api_version: "helm.helm.operator/v1".into(),
            kind: "Chart".into(),
            name: "nginx".into(),
            uid: "uid-1".into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        prepare(&mut d, &owner, "default").unwrap();
        assert_eq!(d.namespace.as_deref(), Some("default"));
        assert_eq!(d.body["metadata"]["namespace"], "default");
        assert_eq!(d.body["metadata"]["ownerReferences"][0]["uid"], "uid-1");
        assert_eq!(d.reference().unwrap().namespace, "default");
    }

    #[test]
    fn node_budget_counts_nested_values() {
        let v = serde_json::json!({"a": [1, 2, 3], "b": {"c": true}});
        assert!(!json_node_budget_exceeded(&v, 100));
        assert!(json_node_budget_exceeded(&v, 3));
    }
}
