//! SQLite implementation of the build store.
//!
//! Uses transactions for build replacement and bounded retry around them.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::retry::{retry_async, RetryConfig};
use super::store::BuildStore;
use crate::errors::AppError;
use crate::models::{Build, BuildComment, BuildStep, BuilderStatus, CommitComment};

/// Keeps `IN (...)` lists well below SQLite's bound-parameter limit.
const MAX_IN_PARAMS: usize = 500;

/// Build store backed by the CI database.
#[derive(Clone)]
pub struct SqliteBuildStore {
    pool: SqlitePool,
    retry: RetryConfig,
}

impl SqliteBuildStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry: RetryConfig::default(),
        }
    }

    /// Override the retry policy used for transactional writes.
    #[cfg(test)]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Look up `(revision, buildId)` pairs for the given commits.
    async fn build_ids_for_commits(
        &self,
        commits: &[String],
    ) -> Result<HashMap<String, Vec<i64>>, AppError> {
        let mut rv: HashMap<String, Vec<i64>> = HashMap::new();
        for chunk in commits.chunks(MAX_IN_PARAMS) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT revision, buildId FROM buildRevisions WHERE revision IN (");
            push_in_list(&mut qb, chunk.iter().map(String::as_str));
            qb.push(") ORDER BY buildId");

            for row in qb.build().fetch_all(&self.pool).await? {
                let revision: String = row.try_get("revision")?;
                let build_id: i64 = row.try_get("buildId")?;
                rv.entry(revision).or_default().push(build_id);
            }
        }
        Ok(rv)
    }

    async fn load_builds(&self, ids: &[i64]) -> Result<HashMap<i64, Build>, AppError> {
        let mut builds: HashMap<i64, Build> = HashMap::new();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, builder, master, number, gotRevision, branch, repository, results, buildslave, started, finished, properties FROM builds WHERE id IN (",
        );
        push_in_list(&mut qb, ids.iter().copied());
        qb.push(")");
        for row in qb.build().fetch_all(&self.pool).await? {
            let build = build_from_row(&row)?;
            builds.insert(build.id, build);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT buildId, name, number, results, started, finished FROM buildSteps WHERE buildId IN (",
        );
        push_in_list(&mut qb, ids.iter().copied());
        qb.push(") ORDER BY buildId, number, id");
        for row in qb.build().fetch_all(&self.pool).await? {
            let build_id: i64 = row.try_get("buildId")?;
            let build = builds.get_mut(&build_id).ok_or_else(|| {
                AppError::Store(format!("Build step references unknown build {}", build_id))
            })?;
            build.steps.push(step_from_row(&row)?);
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT buildId, revision FROM buildRevisions WHERE buildId IN (");
        push_in_list(&mut qb, ids.iter().copied());
        qb.push(") ORDER BY id");
        for row in qb.build().fetch_all(&self.pool).await? {
            let build_id: i64 = row.try_get("buildId")?;
            let build = builds.get_mut(&build_id).ok_or_else(|| {
                AppError::Store(format!("Revision references unknown build {}", build_id))
            })?;
            build.commits.push(row.try_get("revision")?);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, buildId, user, timestamp, message FROM buildComments WHERE buildId IN (",
        );
        push_in_list(&mut qb, ids.iter().copied());
        qb.push(") ORDER BY id");
        for row in qb.build().fetch_all(&self.pool).await? {
            let build_id: i64 = row.try_get("buildId")?;
            let build = builds.get_mut(&build_id).ok_or_else(|| {
                AppError::Store(format!("Comment references unknown build {}", build_id))
            })?;
            build.comments.push(build_comment_from_row(&row)?);
        }

        Ok(builds)
    }

    /// Single attempt at the transactional upsert.
    async fn replace_build_once(&self, build: &Build) -> Result<Build, AppError> {
        let mut tx = self.pool.begin().await?;

        let properties = if build.properties.is_null() {
            None
        } else {
            Some(build.properties.to_string())
        };

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM builds WHERE builder = ? AND master = ? AND number = ?",
        )
        .bind(&build.builder)
        .bind(&build.master)
        .bind(build.number)
        .fetch_optional(&mut *tx)
        .await?;

        let id = match existing {
            Some(id) => {
                sqlx::query(
                    "UPDATE builds SET gotRevision = ?, branch = ?, repository = ?, results = ?, buildslave = ?, started = ?, finished = ?, properties = ? WHERE id = ?",
                )
                .bind(&build.got_revision)
                .bind(&build.branch)
                .bind(&build.repository)
                .bind(build.results)
                .bind(&build.build_slave)
                .bind(build.started)
                .bind(build.finished)
                .bind(&properties)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                // A zero id becomes NULL, which lets SQLite assign one.
                sqlx::query(
                    "INSERT INTO builds (id, builder, master, number, gotRevision, branch, repository, results, buildslave, started, finished, properties) VALUES (NULLIF(?, 0), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(build.id)
                .bind(&build.builder)
                .bind(&build.master)
                .bind(build.number)
                .bind(&build.got_revision)
                .bind(&build.branch)
                .bind(&build.repository)
                .bind(build.results)
                .bind(&build.build_slave)
                .bind(build.started)
                .bind(build.finished)
                .bind(&properties)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid()
            }
        };

        sqlx::query("DELETE FROM buildSteps WHERE buildId = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for step in &build.steps {
            sqlx::query(
                "INSERT INTO buildSteps (buildId, name, number, results, started, finished) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&step.name)
            .bind(step.number)
            .bind(step.results)
            .bind(step.started)
            .bind(step.finished)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM buildRevisions WHERE buildId = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for commit in &build.commits {
            sqlx::query("INSERT INTO buildRevisions (buildId, revision) VALUES (?, ?)")
                .bind(id)
                .bind(commit)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM buildComments WHERE buildId = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let mut comments = Vec::with_capacity(build.comments.len());
        for comment in &build.comments {
            let comment_id = sqlx::query(
                "INSERT INTO buildComments (id, buildId, user, timestamp, message) VALUES (NULLIF(?, 0), ?, ?, ?, ?)",
            )
            .bind(comment.id)
            .bind(id)
            .bind(&comment.user)
            .bind(comment.timestamp)
            .bind(&comment.message)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
            comments.push(BuildComment {
                id: comment_id,
                ..comment.clone()
            });
        }

        tx.commit().await?;

        Ok(Build {
            id,
            comments,
            ..build.clone()
        })
    }
}

#[async_trait]
impl BuildStore for SqliteBuildStore {
    async fn get_builds_for_commits(
        &self,
        commits: &[String],
        exclude_ids: &HashSet<i64>,
    ) -> Result<HashMap<String, Vec<Build>>, AppError> {
        if commits.is_empty() {
            return Ok(HashMap::new());
        }
        let ids_by_commit = self.build_ids_for_commits(commits).await?;
        if ids_by_commit.is_empty() {
            return Ok(HashMap::new());
        }

        let ids: Vec<i64> = ids_by_commit
            .values()
            .flatten()
            .filter(|id| !exclude_ids.contains(*id))
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let builds = self.get_builds_by_id(&ids).await?;

        Ok(ids_by_commit
            .into_iter()
            .map(|(commit, build_ids)| {
                let list = build_ids
                    .iter()
                    .filter_map(|id| builds.get(id).cloned())
                    .collect();
                (commit, list)
            })
            .collect())
    }

    async fn get_builds_by_id(&self, ids: &[i64]) -> Result<HashMap<i64, Build>, AppError> {
        let mut rv = HashMap::new();
        for chunk in ids.chunks(MAX_IN_PARAMS) {
            rv.extend(self.load_builds(chunk).await?);
        }
        Ok(rv)
    }

    async fn get_builder_statuses(
        &self,
        builders: &[String],
    ) -> Result<HashMap<String, BuilderStatus>, AppError> {
        let mut rv = HashMap::new();
        for chunk in builders.chunks(MAX_IN_PARAMS) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT id, builder, user, timestamp, flaky, ignoreFailure, message FROM builderStatus WHERE id IN (SELECT MAX(id) FROM builderStatus WHERE builder IN (",
            );
            push_in_list(&mut qb, chunk.iter().map(String::as_str));
            qb.push(") GROUP BY builder)");

            for row in qb.build().fetch_all(&self.pool).await? {
                let status = builder_status_from_row(&row)?;
                rv.insert(status.builder.clone(), status);
            }
        }
        Ok(rv)
    }

    async fn get_comments_for_commits(
        &self,
        commits: &[String],
    ) -> Result<HashMap<String, Vec<CommitComment>>, AppError> {
        let mut rv: HashMap<String, Vec<CommitComment>> = HashMap::new();
        for chunk in commits.chunks(MAX_IN_PARAMS) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                r#"SELECT id, "commit", user, timestamp, message FROM commitComments WHERE "commit" IN ("#,
            );
            push_in_list(&mut qb, chunk.iter().map(String::as_str));
            qb.push(") ORDER BY id");

            for row in qb.build().fetch_all(&self.pool).await? {
                let comment = commit_comment_from_row(&row)?;
                rv.entry(comment.commit.clone()).or_default().push(comment);
            }
        }
        Ok(rv)
    }

    async fn replace_build(&self, build: &Build) -> Result<Build, AppError> {
        retry_async(
            &self.retry,
            || self.replace_build_once(build),
            |e| matches!(e, AppError::Store(_)),
        )
        .await
    }

    async fn insert_builder_status(&self, status: &BuilderStatus) -> Result<i64, AppError> {
        if status.id != 0 {
            return Err(AppError::Validation(format!(
                "BuilderStatus has non-zero id {}; has it already been inserted?",
                status.id
            )));
        }
        let result = sqlx::query(
            "INSERT INTO builderStatus (builder, user, timestamp, flaky, ignoreFailure, message) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&status.builder)
        .bind(&status.user)
        .bind(status.timestamp)
        .bind(status.flaky)
        .bind(status.ignore_failure)
        .bind(&status.message)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn insert_commit_comment(&self, comment: &CommitComment) -> Result<i64, AppError> {
        if comment.id != 0 {
            return Err(AppError::Validation(format!(
                "CommitComment has non-zero id {}; has it already been inserted?",
                comment.id
            )));
        }
        let result = sqlx::query(
            r#"INSERT INTO commitComments ("commit", user, timestamp, message) VALUES (?, ?, ?, ?)"#,
        )
        .bind(&comment.commit)
        .bind(&comment.user)
        .bind(comment.timestamp)
        .bind(&comment.message)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

/// Push a comma-separated list of bound values.
fn push_in_list<'a, T>(qb: &mut QueryBuilder<'a, Sqlite>, values: impl IntoIterator<Item = T>)
where
    T: 'a + sqlx::Encode<'a, Sqlite> + sqlx::Type<Sqlite> + Send,
{
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
}

fn build_from_row(row: &SqliteRow) -> Result<Build, AppError> {
    let properties: Option<String> = row.try_get("properties")?;
    let properties = match properties.as_deref() {
        None | Some("") => serde_json::Value::Null,
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| AppError::Store(format!("Unable to parse build properties: {}", e)))?,
    };

    Ok(Build {
        id: row.try_get("id")?,
        builder: row.try_get("builder")?,
        master: row.try_get("master")?,
        number: row.try_get("number")?,
        got_revision: row
            .try_get::<Option<String>, _>("gotRevision")?
            .unwrap_or_default(),
        branch: row.try_get("branch")?,
        repository: row.try_get("repository")?,
        results: row.try_get::<Option<i64>, _>("results")?.unwrap_or_default(),
        build_slave: row.try_get("buildslave")?,
        started: row.try_get("started")?,
        finished: row.try_get("finished")?,
        properties,
        steps: Vec::new(),
        commits: Vec::new(),
        comments: Vec::new(),
    })
}

fn step_from_row(row: &SqliteRow) -> Result<BuildStep, AppError> {
    Ok(BuildStep {
        name: row.try_get("name")?,
        number: row.try_get("number")?,
        results: row.try_get::<Option<i64>, _>("results")?.unwrap_or_default(),
        started: row.try_get("started")?,
        finished: row.try_get("finished")?,
    })
}

fn build_comment_from_row(row: &SqliteRow) -> Result<BuildComment, AppError> {
    Ok(BuildComment {
        id: row.try_get("id")?,
        user: row.try_get("user")?,
        timestamp: row.try_get("timestamp")?,
        message: row.try_get("message")?,
    })
}

fn commit_comment_from_row(row: &SqliteRow) -> Result<CommitComment, AppError> {
    Ok(CommitComment {
        id: row.try_get("id")?,
        commit: row.try_get("commit")?,
        user: row.try_get("user")?,
        timestamp: row.try_get("timestamp")?,
        message: row.try_get("message")?,
    })
}

fn builder_status_from_row(row: &SqliteRow) -> Result<BuilderStatus, AppError> {
    Ok(BuilderStatus {
        id: row.try_get("id")?,
        builder: row.try_get("builder")?,
        user: row.try_get("user")?,
        timestamp: row.try_get("timestamp")?,
        flaky: row.try_get("flaky")?,
        ignore_failure: row.try_get("ignoreFailure")?,
        message: row.try_get("message")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;
    use crate::models::results;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    async fn test_store() -> (SqliteBuildStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_database(&temp_dir.path().join("builds.sqlite"))
            .await
            .unwrap();
        (SqliteBuildStore::new(pool), temp_dir)
    }

    fn build(builder: &str, number: i64, commits: &[&str]) -> Build {
        Build {
            id: 0,
            builder: builder.to_string(),
            master: "client.skia".to_string(),
            number,
            got_revision: commits.first().map(|c| c.to_string()).unwrap_or_default(),
            branch: "main".to_string(),
            repository: "https://example.com/repo.git".to_string(),
            results: results::SUCCESS,
            build_slave: "slave-1".to_string(),
            started: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            finished: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap()),
            properties: serde_json::json!([["buildername", builder, "Build"]]),
            steps: vec![BuildStep {
                name: "compile".to_string(),
                number: 0,
                results: results::SUCCESS,
                started: None,
                finished: None,
            }],
            commits: commits.iter().map(|c| c.to_string()).collect(),
            comments: vec![],
        }
    }

    #[tokio::test]
    async fn test_replace_build_roundtrip() {
        let (store, _dir) = test_store().await;

        let stored = store
            .replace_build(&build("Build-A", 1, &["c2", "c1"]))
            .await
            .unwrap();
        assert!(stored.id > 0);

        let loaded = store.get_builds_by_id(&[stored.id]).await.unwrap();
        let loaded = &loaded[&stored.id];
        assert_eq!(loaded.builder, "Build-A");
        assert_eq!(loaded.commits, vec!["c2", "c1"]);
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.properties, stored.properties);
        assert_eq!(loaded.finished, stored.finished);
    }

    #[tokio::test]
    async fn test_replace_build_keeps_id_and_replaces_children() {
        let (store, _dir) = test_store().await;

        let first = store
            .replace_build(&build("Build-A", 1, &["c1"]))
            .await
            .unwrap();

        let mut updated = build("Build-A", 1, &["c1", "c0"]);
        updated.results = results::FAILURE;
        updated.steps.clear();
        updated.comments.push(BuildComment {
            id: 0,
            user: "x".to_string(),
            timestamp: Utc::now(),
            message: "flaky".to_string(),
        });
        let second = store.replace_build(&updated).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(second.comments[0].id > 0);

        let loaded = store.get_builds_by_id(&[first.id]).await.unwrap();
        let loaded = &loaded[&first.id];
        assert_eq!(loaded.results, results::FAILURE);
        assert!(loaded.steps.is_empty());
        assert_eq!(loaded.commits, vec!["c1", "c0"]);
        assert_eq!(loaded.comments.len(), 1);
        assert_eq!(loaded.comments[0].message, "flaky");
    }

    #[tokio::test]
    async fn test_get_builds_for_commits_groups_and_excludes() {
        let (store, _dir) = test_store().await;

        let a = store
            .replace_build(&build("Build-A", 1, &["c1"]))
            .await
            .unwrap();
        let b = store
            .replace_build(&build("Build-B", 1, &["c2", "c1"]))
            .await
            .unwrap();

        let commits = vec!["c1".to_string(), "c2".to_string(), "c3".to_string()];
        let by_commit = store
            .get_builds_for_commits(&commits, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(by_commit["c1"].len(), 2);
        assert_eq!(by_commit["c2"].len(), 1);
        assert!(!by_commit.contains_key("c3"));

        let exclude: HashSet<i64> = [a.id].into_iter().collect();
        let by_commit = store
            .get_builds_for_commits(&commits, &exclude)
            .await
            .unwrap();
        assert_eq!(by_commit["c1"].len(), 1);
        assert_eq!(by_commit["c1"][0].id, b.id);
    }

    #[tokio::test]
    async fn test_builder_status_latest_wins() {
        let (store, _dir) = test_store().await;

        let mut status = BuilderStatus {
            id: 0,
            builder: "Build-A".to_string(),
            user: "sheriff".to_string(),
            timestamp: Utc::now(),
            flaky: false,
            ignore_failure: false,
            message: "looking into it".to_string(),
        };
        let first = store.insert_builder_status(&status).await.unwrap();
        status.message = "fixed".to_string();
        status.flaky = true;
        let second = store.insert_builder_status(&status).await.unwrap();
        assert!(second > first);

        let statuses = store
            .get_builder_statuses(&["Build-A".to_string(), "Build-B".to_string()])
            .await
            .unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses["Build-A"].id, second);
        assert_eq!(statuses["Build-A"].message, "fixed");
        assert!(statuses["Build-A"].flaky);
    }

    #[tokio::test]
    async fn test_insert_builder_status_rejects_existing_id() {
        let (store, _dir) = test_store().await;
        let status = BuilderStatus {
            id: 3,
            builder: "Build-A".to_string(),
            user: "sheriff".to_string(),
            timestamp: Utc::now(),
            flaky: false,
            ignore_failure: false,
            message: String::new(),
        };
        let err = store.insert_builder_status(&status).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_commit_comments_grouped_by_hash() {
        let (store, _dir) = test_store().await;
        for (commit, message) in [("c1", "first"), ("c1", "second"), ("c2", "other")] {
            store
                .insert_commit_comment(&CommitComment {
                    id: 0,
                    commit: commit.to_string(),
                    user: "x".to_string(),
                    timestamp: Utc::now(),
                    message: message.to_string(),
                })
                .await
                .unwrap();
        }

        let comments = store
            .get_comments_for_commits(&["c1".to_string(), "c3".to_string()])
            .await
            .unwrap();
        assert_eq!(comments.len(), 1);
        let messages: Vec<_> = comments["c1"].iter().map(|c| c.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_empty_inputs_skip_queries() {
        let (store, _dir) = test_store().await;
        assert!(store
            .get_builds_for_commits(&[], &HashSet::new())
            .await
            .unwrap()
            .is_empty());
        assert!(store.get_builds_by_id(&[]).await.unwrap().is_empty());
        assert!(store.get_builder_statuses(&[]).await.unwrap().is_empty());
    }
}
