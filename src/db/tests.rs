//! Contract tests run against every embedded backend

use super::*;
use crate::family;
use crate::models::{Cve, Debian, Package, Reference};
use chrono::TimeZone;
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

/// A store together with the directory that backs it
struct Backend {
    _dir: TempDir,
    db: Box<dyn OvalStore>,
}

fn open_sqlite(options: Options) -> Backend {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("oval.sqlite3");
    let db = new_db("sqlite3", path.to_str().unwrap(), false, options).unwrap();
    Backend { _dir: dir, db }
}

fn open_sled(options: Options) -> Backend {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("oval.sled");
    let db = new_db("sled", path.to_str().unwrap(), false, options).unwrap();
    Backend { _dir: dir, db }
}

/// One fresh store per embedded backend.
fn backends() -> Vec<Backend> {
    backends_with(Options::default())
}

fn backends_with(options: Options) -> Vec<Backend> {
    vec![open_sqlite(options.clone()), open_sled(options)]
}

fn feed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 14, 9, 26, 53).unwrap()
}

fn definition(id: &str, cves: &[&str], packs: Vec<Package>) -> Definition {
    let mut def = Definition {
        definition_id: id.to_string(),
        title: format!("{} title", id),
        description: format!("{} description", id),
        affected_packs: packs,
        ..Default::default()
    };
    def.advisory.severity = "Moderate".to_string();
    def.advisory.cves = cves.iter().map(|c| Cve::new(*c)).collect();
    def
}

fn root(family: &str, version: &str, defs: Vec<Definition>) -> Root {
    Root::new(family, version, feed_time()).with_definitions(defs)
}

fn ids(defs: &[Definition]) -> Vec<String> {
    let mut ids: Vec<String> = defs.iter().map(|d| d.definition_id.clone()).collect();
    ids.sort();
    ids
}

fn sorted(mut defs: Vec<Definition>) -> Vec<Definition> {
    defs.sort_by(|a, b| a.definition_id.cmp(&b.definition_id));
    defs
}

/// Deterministic pseudo-random roots for the property checks.
fn generated_root(family: &str, version: &str, seed: u64, count: usize) -> Root {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let mut next = move |m: u64| {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 33) % m
    };
    let names = ["bash", "openssl", "curl", "kernel", "glibc", "zlib"];
    let arches = ["", "x86_64", "aarch64"];

    let defs = (0..count)
        .map(|i| {
            let cves: Vec<String> = (0..1 + next(3)).map(|_| format!("CVE-2023-{:04}", next(40))).collect();
            let cve_refs: Vec<&str> = cves.iter().map(String::as_str).collect();
            let packs = (0..1 + next(3))
                .map(|_| {
                    let name = names[next(names.len() as u64) as usize];
                    let arch = arches[next(arches.len() as u64) as usize];
                    if next(5) == 0 {
                        Package::new(name, "").arch(arch).not_fixed_yet()
                    } else {
                        Package::new(name, format!("0:1.{}-{}.el{}", i, next(9), 7 + next(2))).arch(arch)
                    }
                })
                .collect();
            let mut def = definition(&format!("oval:gen:def:{}:{}", seed, i), &cve_refs, packs);
            def.references = cves
                .iter()
                .map(|c| Reference::new("CVE", c.clone(), format!("https://example.org/{}", c)))
                .collect();
            def
        })
        .collect();
    root(family, version, defs)
}

// ============================================================================
// Scenarios
// ============================================================================

mod scenario_tests {
    use super::*;

    fn centos_root(bash_version: &str) -> Root {
        root(
            "centos",
            "7",
            vec![definition(
                "oval:com.redhat.rhsa:def:20190001",
                &["CVE-2019-9924"],
                vec![Package::new("bash", bash_version)],
            )],
        )
    }

    #[test]
    fn test_derivative_family_resolves_to_upstream() {
        for b in backends() {
            b.db.insert_root(&centos_root("0:4.2.46-34.el7")).unwrap();

            let via_centos = b.db.get_by_cve_id("centos", "7", "CVE-2019-9924", "").unwrap();
            assert_eq!(via_centos.len(), 1, "{}", b.db.name());
            assert_eq!(via_centos[0].affected_packs, vec![Package::new("bash", "0:4.2.46-34.el7")]);

            let via_redhat = b.db.get_by_cve_id("redhat", "7", "CVE-2019-9924", "").unwrap();
            assert_eq!(via_centos, via_redhat);
        }
    }

    #[test]
    fn test_major_filter_strips_foreign_builds() {
        for b in backends() {
            b.db.insert_root(&centos_root("0:4.2.46-34.el8")).unwrap();

            let defs = b.db.get_by_cve_id("centos", "7", "CVE-2019-9924", "").unwrap();
            assert_eq!(defs.len(), 1, "{}", b.db.name());
            assert!(defs[0].affected_packs.is_empty());
            assert_eq!(defs[0].advisory.severity, "Moderate");
            assert_eq!(defs[0].advisory.cves, vec![Cve::new("CVE-2019-9924")]);

            // the package lookup still finds it, with the foreign build stripped
            let by_name = b.db.get_by_package_name("redhat", "7", "bash", "").unwrap();
            assert_eq!(ids(&by_name), vec!["oval:com.redhat.rhsa:def:20190001"], "{}", b.db.name());
            assert!(by_name[0].affected_packs.is_empty());
        }
    }

    #[test]
    fn test_arch_filter_on_cve_lookup() {
        for b in backends() {
            let x86 = definition(
                "oval:com.amazon:def:1",
                &["CVE-2019-9924"],
                vec![Package::new("bash", "4.2.46-34.amzn2").arch("x86_64")],
            );
            let arm = definition(
                "oval:com.amazon:def:2",
                &["CVE-2019-9924"],
                vec![Package::new("bash", "4.2.46-34.amzn2").arch("aarch64")],
            );
            b.db.insert_root(&root("amazon", "2", vec![x86, arm])).unwrap();

            let defs = sorted(b.db.get_by_cve_id("amazon", "2", "CVE-2019-9924", "x86_64").unwrap());
            assert_eq!(defs.len(), 2, "{}", b.db.name());
            assert!(
                defs.iter().flat_map(|d| &d.affected_packs).all(|p| p.arch == "x86_64"),
                "{} returned a foreign arch",
                b.db.name()
            );
            assert_eq!(
                defs[0].affected_packs,
                vec![Package::new("bash", "4.2.46-34.amzn2").arch("x86_64")]
            );
            assert!(defs[1].affected_packs.is_empty());

            let by_name = b.db.get_by_package_name("amazon", "2", "bash", "x86_64").unwrap();
            assert_eq!(ids(&by_name), vec!["oval:com.amazon:def:1"]);

            let all = sorted(b.db.get_by_cve_id("amazon", "2 (Karoo)", "CVE-2019-9924", "").unwrap());
            assert_eq!(all[0].affected_packs[0].arch, "x86_64");
            assert_eq!(all[1].affected_packs[0].arch, "aarch64");
        }
    }

    #[test]
    fn test_ubuntu_advisories_from_notice_urls() {
        for b in backends() {
            let mut def = definition(
                "oval:com.ubuntu.focal:def:201606340000000",
                &["CVE-2016-0634", "CVE-2016-7543", "CVE-2016-0634"],
                vec![Package::new("bash", "4.4-2ubuntu1")],
            );
            def.references = vec![
                Reference::new("CVE", "CVE-2016-0634", "https://cve.mitre.org/cgi-bin/cvename.cgi?name=CVE-2016-0634"),
                Reference::new("Ref", "", "https://ubuntu.com/security/notices/USN-3294-1"),
                Reference::new("Ref", "", "https://ubuntu.com/security/CVE-2016-0634"),
            ];
            b.db.insert_root(&root("ubuntu", "20.04", vec![def])).unwrap();

            let advs = b.db.get_advisories("ubuntu", "20.04").unwrap();
            assert_eq!(advs.len(), 1, "{}", b.db.name());
            assert_eq!(advs["USN-3294-1"], vec!["CVE-2016-0634", "CVE-2016-7543"]);
        }
    }

    #[test]
    fn test_debian_advisories_from_dsa() {
        for b in backends() {
            let mut def = definition(
                "oval:org.debian:def:1",
                &["CVE-2022-0001", "CVE-2022-0002"],
                vec![Package::new("openssl", "1.1.1n-0+deb11u4")],
            );
            def.debian = Some(Debian { dsa: "DSA-1234-1".into() });
            let no_dsa = definition("oval:org.debian:def:2", &["CVE-2022-0003"], vec![]);
            b.db.insert_root(&root("raspbian", "11.6", vec![def, no_dsa])).unwrap();

            let advs = b.db.get_advisories("debian", "11").unwrap();
            assert_eq!(advs.len(), 1, "{}", b.db.name());
            assert_eq!(advs["DSA-1234-1"], vec!["CVE-2022-0001", "CVE-2022-0002"]);

            let defs = b.db.get_by_package_name("debian", "11", "openssl", "").unwrap();
            assert_eq!(defs[0].debian, Some(Debian { dsa: "DSA-1234-1".into() }));
        }
    }

    #[test]
    fn test_snapshot_replacement_drops_removed_definition() {
        for b in backends() {
            let defs_a = vec![
                definition("oval:org.opensuse:def:1", &["CVE-2021-1"], vec![Package::new("bash", "5.1-1")]),
                definition("oval:org.opensuse:def:2", &["CVE-2021-2"], vec![Package::new("zsh", "5.8-1")]),
                definition("oval:org.opensuse:def:3", &["CVE-2021-3"], vec![Package::new("curl", "7.79-1")]),
            ];
            b.db.insert_root(&root("opensuse.leap", "15.3", defs_a.clone())).unwrap();
            assert_eq!(b.db.count_defs("opensuse.leap", "15.3").unwrap(), 3);

            b.db.insert_root(&root("opensuse.leap", "15.3", defs_a[..2].to_vec())).unwrap();
            assert_eq!(b.db.count_defs("opensuse.leap", "15.3").unwrap(), 2, "{}", b.db.name());
            assert!(b.db.get_by_cve_id("opensuse.leap", "15.3", "CVE-2021-3", "").unwrap().is_empty());
            assert!(b.db.get_by_package_name("opensuse.leap", "15.3", "curl", "").unwrap().is_empty());
            assert_eq!(
                ids(&b.db.get_by_package_name("opensuse.leap", "15.3", "zsh", "").unwrap()),
                vec!["oval:org.opensuse:def:2"]
            );
        }
    }

    #[test]
    fn test_locked_embedded_file_is_reported() {
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use sqlx::ConnectOptions;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.sqlite3");
        let rt = tokio::runtime::Runtime::new().unwrap();

        // Another writer creates the file and holds an exclusive lock on it
        let mut holder = rt
            .block_on(
                SqliteConnectOptions::new()
                    .filename(&path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Delete)
                    .connect(),
            )
            .unwrap();
        rt.block_on(sqlx::query("CREATE TABLE t (x INTEGER)").execute(&mut holder)).unwrap();
        rt.block_on(sqlx::query("BEGIN EXCLUSIVE").execute(&mut holder)).unwrap();

        let err = new_db("sqlite3", path.to_str().unwrap(), false, Options::default())
            .err()
            .expect("open must fail while the file is locked");
        assert!(err.is_locked(), "unexpected error: {}", err);

        rt.block_on(sqlx::query("ROLLBACK").execute(&mut holder)).unwrap();
    }
}

// ============================================================================
// Properties
// ============================================================================

mod property_tests {
    use super::*;

    const SEEDS: [u64; 3] = [7, 42, 1009];

    #[test]
    fn test_ingest_count_matches_unique_ids() {
        for b in backends() {
            for seed in SEEDS {
                let mut r = generated_root("fedora", "37", seed, 25);
                // repeated id collapses to one definition
                r.definitions.push(r.definitions[0].clone());
                b.db.insert_root(&r).unwrap();
                assert_eq!(b.db.count_defs("fedora", "37").unwrap(), 25, "{} seed {}", b.db.name(), seed);
            }
        }
    }

    #[test]
    fn test_replacement_leaves_nothing_reachable_from_old_snapshot() {
        for b in backends() {
            let r1 = generated_root("oracle", "8", 1, 30);
            let r2 = generated_root("oracle", "8", 2, 12);
            b.db.insert_root(&r1).unwrap();
            b.db.insert_root(&r2).unwrap();

            let allowed: Vec<String> = ids(&r2.definitions);
            for def in r1.definitions.iter().chain(&r2.definitions) {
                for cve in def.cve_ids() {
                    for got in b.db.get_by_cve_id("oracle", "8", cve, "").unwrap() {
                        assert!(allowed.contains(&got.definition_id), "{} {}", b.db.name(), got.definition_id);
                    }
                }
                for pack in &def.affected_packs {
                    for got in b.db.get_by_package_name("oracle", "8", &pack.name, "").unwrap() {
                        assert!(allowed.contains(&got.definition_id), "{} {}", b.db.name(), got.definition_id);
                    }
                }
            }
            assert_eq!(b.db.count_defs("oracle", "8").unwrap(), 12);
        }
    }

    #[test]
    fn test_every_membership_is_indexed() {
        for b in backends() {
            // redhat 7 feeds carry el8 builds that the major filter strips
            for (fam, ver, seed) in [("opensuse", "15.4", 99), ("redhat", "7", 98)] {
                let r = generated_root(fam, ver, seed, 20);
                b.db.insert_root(&r).unwrap();

                for def in &r.definitions {
                    for pack in &def.affected_packs {
                        let got = b.db.get_by_package_name(fam, ver, &pack.name, "").unwrap();
                        assert!(ids(&got).contains(&def.definition_id), "{} {} {}", b.db.name(), fam, pack.name);
                    }
                    for cve in def.cve_ids() {
                        let got = b.db.get_by_cve_id(fam, ver, cve, "").unwrap();
                        assert!(ids(&got).contains(&def.definition_id), "{} {}", b.db.name(), fam);
                        let unique: std::collections::HashSet<_> = got.iter().map(|d| &d.definition_id).collect();
                        assert_eq!(unique.len(), got.len(), "one result per definition id");
                    }
                }
            }
        }
    }

    #[test]
    fn test_repeated_id_keeps_first_occurrence() {
        let stores = backends();
        let mut first = definition(
            "oval:com.redhat.rhsa:def:20200001",
            &["CVE-2020-1000"],
            vec![Package::new("bash", "0:4.2.46-34.el7")],
        );
        first.references = vec![Reference::new("RHSA", "RHSA-2020:0001", "")];
        let mut second = definition(
            "oval:com.redhat.rhsa:def:20200001",
            &["CVE-2020-2000"],
            vec![Package::new("zsh", "0:5.0.2-34.el7")],
        );
        second.references = vec![Reference::new("RHSA", "RHSA-2020:0002", "")];
        let r = root("redhat", "7", vec![first.clone(), second]);

        for b in &stores {
            b.db.insert_root(&r).unwrap();
            assert_eq!(b.db.count_defs("redhat", "7").unwrap(), 1, "{}", b.db.name());

            let kept = b.db.get_by_cve_id("redhat", "7", "CVE-2020-1000", "").unwrap();
            assert_eq!(ids(&kept), vec![first.definition_id.clone()], "{}", b.db.name());
            assert_eq!(kept[0].cve_ids().collect::<Vec<_>>(), vec!["CVE-2020-1000"]);
            assert_eq!(kept[0].affected_packs, first.affected_packs);
            assert!(b.db.get_by_cve_id("redhat", "7", "CVE-2020-2000", "").unwrap().is_empty(), "{}", b.db.name());
            assert!(b.db.get_by_package_name("redhat", "7", "zsh", "").unwrap().is_empty(), "{}", b.db.name());
            assert_eq!(ids(&b.db.get_by_package_name("redhat", "7", "bash", "").unwrap()).len(), 1);

            let advs = b.db.get_advisories("redhat", "7").unwrap();
            assert_eq!(advs.len(), 1, "{}", b.db.name());
            assert_eq!(advs["RHSA-2020:0001"], vec!["CVE-2020-1000"]);
        }
    }

    #[test]
    fn test_last_modified_agrees_across_backends() {
        let stores = backends();
        let stamp = Utc.with_ymd_and_hms(2024, 3, 14, 9, 26, 53).unwrap() + chrono::Duration::milliseconds(589);
        let r = Root::new("alpine", "3.19", stamp);

        for b in &stores {
            b.db.insert_root(&r).unwrap();
        }
        let got: Vec<DateTime<Utc>> = stores
            .iter()
            .map(|b| b.db.last_modified("alpine", "3.19").unwrap())
            .collect();
        assert_eq!(got[0], got[1]);
        assert_eq!(got[0], Utc.with_ymd_and_hms(2024, 3, 14, 9, 26, 53).unwrap());
    }

    #[test]
    fn test_aliases_agree() {
        for b in backends() {
            b.db.insert_root(&generated_root("redhat", "7", 5, 15)).unwrap();
            b.db.insert_root(&generated_root("debian", "12", 6, 15)).unwrap();

            for cve in (0..40).map(|n| format!("CVE-2023-{:04}", n)) {
                assert_eq!(
                    sorted(b.db.get_by_cve_id("centos", "7.9.2009", &cve, "").unwrap()),
                    sorted(b.db.get_by_cve_id("redhat", "7", &cve, "").unwrap())
                );
                assert_eq!(
                    sorted(b.db.get_by_cve_id("raspbian", "12.1", &cve, "").unwrap()),
                    sorted(b.db.get_by_cve_id("debian", "12", &cve, "").unwrap())
                );
            }
        }
    }

    #[test]
    fn test_arch_filter_returns_only_requested_arch() {
        for b in backends() {
            for (fam, ver) in [("amazon", "2023"), ("oracle", "9"), ("fedora", "38")] {
                let r = generated_root(fam, ver, 11, 20);
                b.db.insert_root(&r).unwrap();

                for name in ["bash", "openssl", "curl", "kernel", "glibc", "zlib"] {
                    let all = b.db.get_by_package_name(fam, ver, name, "").unwrap();
                    let arches: Vec<String> = all
                        .iter()
                        .flat_map(|d| d.affected_packs.iter().map(|p| p.arch.clone()))
                        .filter(|a| !a.is_empty())
                        .collect();
                    for arch in arches {
                        let narrowed = b.db.get_by_package_name(fam, ver, name, &arch).unwrap();
                        assert!(narrowed.len() <= all.len());
                        for def in &narrowed {
                            assert!(def.affected_packs.iter().all(|p| p.arch == arch), "{} {}", b.db.name(), fam);
                            assert!(def.affected_packs.iter().any(|p| p.name == name));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_redhat_results_match_major() {
        for b in backends() {
            let r = generated_root("redhat", "8", 23, 30);
            b.db.insert_root(&r).unwrap();

            for def in &r.definitions {
                for cve in def.cve_ids() {
                    for got in b.db.get_by_cve_id("redhat", "8", cve, "").unwrap() {
                        for p in &got.affected_packs {
                            assert!(
                                p.not_fixed_yet || p.version.contains(".el8") || p.version.contains(".module+el8"),
                                "{} kept {:?}",
                                b.db.name(),
                                p
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_advisory_lists_have_no_duplicates() {
        for b in backends() {
            let mut r = generated_root("opensuse.leap", "15.5", 3, 20);
            for (i, def) in r.definitions.iter_mut().enumerate() {
                def.references
                    .push(Reference::new("SUSE-SU", format!("SUSE-SU-2023:{}-1", i % 4), ""));
                let first = def.advisory.cves[0].clone();
                def.advisory.cves.push(first);
            }
            b.db.insert_root(&r).unwrap();

            let advs = b.db.get_advisories("opensuse.leap", "15.5").unwrap();
            assert_eq!(advs.len(), 4, "{}", b.db.name());
            for cves in advs.values() {
                let unique: std::collections::HashSet<_> = cves.iter().collect();
                assert_eq!(unique.len(), cves.len());
            }
        }
    }

    #[test]
    fn test_backends_return_identical_definitions() {
        let stores = backends();
        let r = generated_root("ubuntu", "22.04", 77, 20);
        for b in &stores {
            b.db.insert_root(&r).unwrap();
        }

        for def in &r.definitions {
            for cve in def.cve_ids() {
                let a = sorted(stores[0].db.get_by_cve_id("ubuntu", "22.04", cve, "").unwrap());
                let k = sorted(stores[1].db.get_by_cve_id("ubuntu", "22.04", cve, "").unwrap());
                assert_eq!(a, k);
            }
        }
        assert_eq!(
            stores[0].db.get_advisories("ubuntu", "22.04").unwrap(),
            stores[1].db.get_advisories("ubuntu", "22.04").unwrap()
        );
    }
}

// ============================================================================
// Metadata, gates and configuration
// ============================================================================

mod gate_tests {
    use super::*;
    use crate::db::kv::keyspace::{Keyspace, WriteBatch};

    #[test]
    fn test_legacy_sqlite_layout_is_refused_without_migrating() {
        use sqlx::sqlite::SqliteConnectOptions;
        use sqlx::{ConnectOptions, Row};

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v1.sqlite3");
        let rt = tokio::runtime::Runtime::new().unwrap();
        let connect = SqliteConnectOptions::new().filename(&path).create_if_missing(true);

        let mut conn = rt.block_on(connect.clone().connect()).unwrap();
        rt.block_on(
            sqlx::query("CREATE TABLE fetch_meta (id INTEGER PRIMARY KEY, go_oval_dict_revision TEXT, file_name TEXT)")
                .execute(&mut conn),
        )
        .unwrap();
        drop(conn);

        let err = new_db("sqlite3", path.to_str().unwrap(), false, Options::default())
            .err()
            .unwrap();
        assert!(err.is_schema_incompatible());
        assert!(err.to_string().contains("Delete the database"));

        let mut conn = rt.block_on(connect.connect()).unwrap();
        let row = rt
            .block_on(
                sqlx::query("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'roots'")
                    .fetch_one(&mut conn),
            )
            .unwrap();
        assert_eq!(row.get::<i64, _>(0), 0);
    }

    #[test]
    fn test_sqlite_roots_are_unique_per_family_and_version() {
        use sqlx::sqlite::SqliteConnectOptions;
        use sqlx::{ConnectOptions, Row};

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oval.sqlite3");
        let db = new_db("sqlite3", path.to_str().unwrap(), false, Options::default()).unwrap();
        db.insert_root(&root("redhat", "8", vec![])).unwrap();
        db.insert_root(&root("redhat", "8", vec![])).unwrap();
        db.close().unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut conn = rt.block_on(SqliteConnectOptions::new().filename(&path).connect()).unwrap();
        let row = rt
            .block_on(
                sqlx::query("SELECT sql FROM sqlite_master WHERE type = 'index' AND name = 'uidx_roots_family_os_version'")
                    .fetch_one(&mut conn),
            )
            .unwrap();
        assert!(row.get::<String, _>(0).starts_with("CREATE UNIQUE INDEX"));

        let dup = rt.block_on(
            sqlx::query("INSERT INTO roots (id, family, os_version, timestamp) VALUES (99, 'redhat', '8', '')")
                .execute(&mut conn),
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_legacy_kv_layout_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v1.sled");
        {
            let ks = Keyspace::open(&path).unwrap();
            let mut batch = WriteBatch::new();
            batch.hset("OVAL#redhat#7#DEF", "oval:1", "{}");
            ks.apply(batch).unwrap();
            ks.flush().unwrap();
        }

        let err = new_db("redis", path.to_str().unwrap(), false, Options::default())
            .err()
            .unwrap();
        assert!(err.is_schema_incompatible());
    }

    #[test]
    fn test_fetch_meta_round_trip() {
        for b in backends() {
            let fresh = b.db.fetch_meta().unwrap();
            assert_eq!(fresh, FetchMeta::default(), "{}", b.db.name());

            let meta = FetchMeta {
                revision: "someone-else".into(),
                schema_version: 1,
                last_fetched_at: feed_time(),
            };
            b.db.upsert_fetch_meta(&meta).unwrap();
            b.db.upsert_fetch_meta(&meta).unwrap();

            let stored = b.db.fetch_meta().unwrap();
            assert_eq!(stored.revision, REVISION);
            assert_eq!(stored.schema_version, LATEST_SCHEMA_VERSION);
            assert_eq!(stored.last_fetched_at, feed_time());
            assert!(!stored.outdated());
        }
    }

    #[test]
    fn test_last_modified_defaults_to_very_old() {
        for b in backends() {
            let before = very_old();
            let got = b.db.last_modified("alpine", "3.18").unwrap();
            assert!(got >= before && got <= very_old(), "{}", b.db.name());

            b.db.insert_root(&root("alpine", "3.18.4", vec![])).unwrap();
            assert_eq!(b.db.last_modified("alpine", "3.18").unwrap(), feed_time());
            assert_eq!(b.db.count_defs("alpine", "3.18").unwrap(), 0);
            assert!(b.db.get_advisories("alpine", "3.18").unwrap().is_empty());
        }
    }

    #[test]
    fn test_bad_batch_size_fails_before_writing() {
        for b in backends_with(Options::default().batch_size(0)) {
            let r = generated_root("redhat", "9", 8, 3);
            let err = b.db.insert_root(&r).unwrap_err();
            assert!(matches!(err.root_cause(), OvalError::Config(_)), "{}", b.db.name());
            assert_eq!(b.db.count_defs("redhat", "9").unwrap(), 0);
            assert!(b.db.last_modified("redhat", "9").unwrap() < feed_time());
        }
    }

    #[test]
    fn test_small_batches_store_everything() {
        for b in backends_with(Options::default().batch_size(3)) {
            let r = generated_root("suse.enterprise.server", "15.5", 4, 40);
            b.db.insert_root(&r).unwrap();
            assert_eq!(b.db.count_defs("suse.enterprise.server", "15.5").unwrap(), 40, "{}", b.db.name());
        }
    }

    #[test]
    fn test_unknown_family_is_an_error() {
        for b in backends() {
            let err = b.db.count_defs("gentoo", "1").unwrap_err();
            assert!(matches!(err, OvalError::UnsupportedFamily { ref family } if family == "gentoo"));
            assert!(b.db.insert_root(&root("windows", "10", vec![])).is_err());
        }
    }

    #[test]
    fn test_closed_store_refuses_work() {
        for b in backends() {
            b.db.close().unwrap();
            b.db.close().unwrap();
            let err = b.db.count_defs("debian", "11").unwrap_err();
            assert!(matches!(err.root_cause(), OvalError::Closed), "{}", b.db.name());
        }
    }

    #[test]
    fn test_driver_names() {
        let stores = backends();
        assert_eq!(stores[0].db.name(), "sqlite3");
        assert_eq!(stores[1].db.name(), "sled");
    }

    #[test]
    fn test_unsupported_dialect() {
        let err = new_db("oracle-db", "x", false, Options::default()).err().unwrap();
        assert!(matches!(err, OvalError::UnsupportedDialect(ref d) if d == "oracle-db"));
    }

    #[test]
    fn test_dialect_tags() {
        assert_eq!("redis".parse::<Dialect>().unwrap(), Dialect::Sled);
        assert_eq!("postgres".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert!(Dialect::Mysql.is_relational());
        assert!(!Dialect::Sled.is_relational());
        assert_eq!(Dialect::Sqlite3.to_string(), "sqlite3");
    }

    #[test]
    fn test_options_from_lookup() {
        let env = |key: &str| match key {
            "OVALDB_BATCH_SIZE" => Some("200".to_string()),
            "OVALDB_READ_TIMEOUT_SECS" => Some("3".to_string()),
            _ => None,
        };
        let opts = Options::from_lookup(env).unwrap();
        assert_eq!(opts.batch_size, 200);
        assert_eq!(opts.kv_read_timeout, Some(Duration::from_secs(3)));
        assert_eq!(opts.max_connections, 5);

        let zero = Options::from_lookup(|k| (k == "OVALDB_READ_TIMEOUT_SECS").then(|| "0".to_string())).unwrap();
        assert_eq!(zero.kv_read_timeout, None);

        let bad = Options::from_lookup(|k| (k == "OVALDB_BATCH_SIZE").then(|| "many".to_string()));
        assert!(matches!(bad, Err(OvalError::Config(_))));
    }

    #[test]
    fn test_checked_batch_size() {
        assert_eq!(Options::default().checked_batch_size().unwrap(), 50);
        assert!(Options::default().batch_size(-1).checked_batch_size().is_err());
        assert_eq!(bounded_chunk(5000), HOST_PARAM_CHUNK);
        assert_eq!(bounded_chunk(10), 10);
    }

    #[test]
    fn test_canonical_pair_is_shared_by_reads_and_writes() {
        for b in backends() {
            b.db.insert_root(&root("ubuntu", "20.04.6", vec![definition("d", &["CVE-1"], vec![])])).unwrap();
            assert_eq!(family::canonicalize("ubuntu", "20.04.6").unwrap().1, "20.04");
            assert_eq!(b.db.count_defs("ubuntu", "20.04").unwrap(), 1, "{}", b.db.name());
        }
    }
}
