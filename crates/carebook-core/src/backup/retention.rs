//! Retention selection
//!
//! Pure function over manifest entries so the policy can be tested without a
//! transport. Entries are partitioned by device; within a partition the
//! newest backup of each recent day, month, and year survives.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Datelike, Utc};

use crate::models::{BackupFileMetadata, RetentionPolicy};

/// File ids that `policy` does not keep, oldest first.
#[must_use]
pub fn select_for_deletion(
    files: &[BackupFileMetadata],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut partitions: BTreeMap<&str, Vec<&BackupFileMetadata>> = BTreeMap::new();
    for file in files {
        partitions.entry(file.device_id.as_str()).or_default().push(file);
    }

    let mut doomed = Vec::new();
    for mut partition in partitions.into_values() {
        // Newest first, so the first file seen in each bucket is its newest.
        partition.sort_by(|a, b| {
            b.backup_timestamp
                .cmp(&a.backup_timestamp)
                .then_with(|| b.file_id.cmp(&a.file_id))
        });

        let mut keep: HashSet<&str> = HashSet::new();
        keep.extend(newest_per_bucket(&partition, policy.max_daily_backups, |ts| {
            (ts.year(), ts.ordinal())
        }));
        keep.extend(newest_per_bucket(&partition, policy.max_monthly_backups, |ts| {
            (ts.year(), ts.month())
        }));
        keep.extend(newest_per_bucket(&partition, policy.max_yearly_backups, |ts| {
            (ts.year(), 0)
        }));

        let max_age = chrono::Duration::from_std(policy.max_age).unwrap_or(chrono::Duration::MAX);
        let newest = partition.first().map(|file| file.file_id.as_str());
        keep.retain(|id| {
            Some(*id) == newest
                || partition
                    .iter()
                    .find(|file| file.file_id == *id)
                    .is_some_and(|file| now.signed_duration_since(file.backup_timestamp) <= max_age)
        });
        // A partition never loses its newest backup.
        keep.extend(newest);

        doomed.extend(
            partition
                .iter()
                .rev()
                .filter(|file| !keep.contains(file.file_id.as_str()))
                .map(|file| file.file_id.clone()),
        );
    }
    doomed
}

/// Ids of the newest file in each of the `limit` most recent buckets.
fn newest_per_bucket<'a, K: PartialEq>(
    newest_first: &[&'a BackupFileMetadata],
    limit: usize,
    bucket: impl Fn(DateTime<Utc>) -> K,
) -> Vec<&'a str> {
    let mut kept = Vec::new();
    let mut last_bucket: Option<K> = None;
    for file in newest_first {
        if kept.len() >= limit {
            break;
        }
        let key = bucket(file.backup_timestamp);
        if last_bucket.as_ref() != Some(&key) {
            kept.push(file.file_id.as_str());
            last_bucket = Some(key);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackupType;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::Map;

    fn backup(id: &str, device: &str, at: DateTime<Utc>) -> BackupFileMetadata {
        BackupFileMetadata {
            file_id: id.to_string(),
            file_name: format!("{id}.enc"),
            clinic_id: "c1".to_string(),
            device_id: device.to_string(),
            backup_timestamp: at,
            backup_type: BackupType::Full,
            version: 1,
            size: 1,
            checksum: String::new(),
            additional_data: Map::new(),
        }
    }

    fn daily(device: &str, start: DateTime<Utc>, days: i64) -> Vec<BackupFileMetadata> {
        (0..days)
            .map(|day| backup(&format!("{device}-{day}"), device, start + Duration::days(day)))
            .collect()
    }

    #[test]
    fn hundred_daily_backups_keep_recent_days_plus_representatives() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let files = daily("desk", start, 100);
        let now = start + Duration::days(100);

        let deleted = select_for_deletion(&files, &RetentionPolicy::default(), now);

        // Days 70..=99 are the 30 most recent (2024-03-11 ..= 2024-04-09).
        let mut expected_kept: Vec<String> = (70..100).map(|day| format!("desk-{day}")).collect();
        // Month representatives outside that window: Feb 29 (day 59), Jan 31 (day 30).
        expected_kept.push("desk-59".to_string());
        expected_kept.push("desk-30".to_string());

        let kept: Vec<String> = files
            .iter()
            .map(|file| file.file_id.clone())
            .filter(|id| !deleted.contains(id))
            .collect();
        assert_eq!(kept.len(), expected_kept.len());
        for id in &expected_kept {
            assert!(kept.contains(id), "{id} should be kept");
        }

        // Deleted ids are exactly the complement.
        assert_eq!(deleted.len() + kept.len(), files.len());
        assert!(deleted.iter().all(|id| !expected_kept.contains(id)));
    }

    #[test]
    fn several_backups_per_day_keep_only_the_newest() {
        let day = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let files = vec![
            backup("morning", "desk", day),
            backup("noon", "desk", day + Duration::hours(4)),
            backup("evening", "desk", day + Duration::hours(10)),
        ];
        let deleted = select_for_deletion(&files, &RetentionPolicy::default(), day);
        assert_eq!(deleted, vec!["morning".to_string(), "noon".to_string()]);
    }

    #[test]
    fn partitions_are_independent() {
        let day = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let files = vec![
            backup("desk-old", "desk", day),
            backup("desk-new", "desk", day + Duration::hours(1)),
            backup("tablet-only", "tablet", day - Duration::hours(5)),
        ];
        let deleted = select_for_deletion(&files, &RetentionPolicy::minimal(), day);
        assert_eq!(deleted, vec!["desk-old".to_string()]);
    }

    #[test]
    fn max_age_drops_old_backups_but_not_the_newest() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let files = vec![
            backup("ancient", "desk", now - Duration::days(365 * 3)),
            backup("old", "desk", now - Duration::days(365 * 2)),
        ];
        let deleted = select_for_deletion(&files, &RetentionPolicy::minimal(), now);
        assert_eq!(deleted, vec!["ancient".to_string()]);

        let lonely = vec![backup("only", "desk", now - Duration::days(365 * 9))];
        assert!(select_for_deletion(&lonely, &RetentionPolicy::minimal(), now).is_empty());
    }

    #[test]
    fn zero_limits_still_keep_newest() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let files = daily("desk", now - Duration::days(5), 5);
        let policy = RetentionPolicy {
            max_daily_backups: 0,
            max_monthly_backups: 0,
            max_yearly_backups: 0,
            max_age: std::time::Duration::from_secs(0),
        };
        let deleted = select_for_deletion(&files, &policy, now);
        assert_eq!(deleted.len(), 4);
        assert!(!deleted.contains(&"desk-4".to_string()));
    }
}
