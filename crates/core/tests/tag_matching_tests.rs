//! Tag filtering, matching and fanout through the public API.

use kubetools_core::{Error, TagSet, Version, intersect};

fn set(repository: &str, raw: &str) -> TagSet {
    TagSet::from_lines(repository, raw.lines())
}

#[test]
fn raw_git_output_is_filtered_and_ordered() {
    let tags = set(
        "kubernetes",
        "v1.10.0\n  v1.9.3  \n\nv1.28.0-rc.1\nv1.2\nv1.27.3\n",
    );
    assert_eq!(tags.tags(), ["v1.2", "v1.9.3", "v1.10.0", "v1.27.3"]);
    assert_eq!(tags.latest().unwrap(), "v1.27.3");

    let parsed: Vec<Version> = tags.tags().iter().map(|t| t.parse().unwrap()).collect();
    assert!(parsed.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn three_way_intersection_keeps_common_versions() {
    let matched = intersect(&[
        set("kubernetes", "v1.26.0\nv1.27.0\nv1.28.0\nv1.29.0"),
        set("openshift", "v1.27.0\nv1.28.0\nv1.29.0-alpha.1"),
        set("kustomize", "v1.28.0\nv1.27.0\nv1.20.0"),
    ]);

    assert_eq!(matched.versions(), ["v1.27.0", "v1.28.0"]);
    assert_eq!(matched.repositories(), ["kubernetes", "openshift", "kustomize"]);
}

#[test]
fn fanout_takes_highest_common_versions() {
    let upstream = (0..12).map(|minor| format!("v1.{minor}.0")).collect::<Vec<_>>().join("\n");
    let matched = intersect(&[set("kubernetes", &upstream), set("openshift", &upstream)]);

    for fanout in 1..=15 {
        let selected = matched.select_latest(fanout).unwrap();
        assert_eq!(selected.len(), fanout.min(12));
        assert_eq!(selected.last().map(String::as_str), Some("v1.11.0"));
        assert!(selected.iter().all(|v| matched.versions().contains(v)));
    }
}

#[test]
fn disjoint_repositories_report_no_matching_versions() {
    let matched = intersect(&[set("kubernetes", "v1.28.0"), set("openshift", "v4.14.0")]);

    let err = matched.select_latest(5).unwrap_err();
    match err {
        Error::NoMatchingVersions { repositories } => {
            assert_eq!(repositories, ["kubernetes", "openshift"]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn empty_tag_set_has_no_latest() {
    let tags = set("helm", "v3.13.0-rc.1\n\n");
    assert!(tags.is_empty());
    assert!(matches!(tags.latest(), Err(Error::EmptyTagSet { .. })));
}
