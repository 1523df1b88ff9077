//! Lifecycle operations on a [`WikiRequest`].
//!
//! Every collaborator is passed in through [`RequestServices`]; nothing here
//! reaches for global state. Status changes go through
//! [`transition`](crate::status::transition) so approval stays sticky.

use std::collections::BTreeMap;

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::clock::Clock;
use crate::error::{RequestError, RequestResult};
use crate::jobs::{CreateWikiJob, JobSubmitter};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::provision::{ProvisionRequest, Provisioner, requested_link};
use crate::request::{Comment, RequestId, User, WikiRequest, derive_dbname};
use crate::status::{RequestStatus, transition};
use crate::store::{CommentRow, RequestRow, RequestStore, find_conflict};
use crate::users::UserDirectory;

pub const UPDATED_REQUEST_COMMENT: &str = "Updated request.";
const DEFERRED_APPROVAL_COMMENT: &str = "Request approved.";
const IMMEDIATE_APPROVAL_COMMENT: &str = "Request approved and wiki created.";

/// How approval provisions the wiki. Picked once when services are built.
#[derive(Clone, Copy)]
pub enum ApprovalBackend<'a> {
    /// Queue a creation job and return straight away.
    Deferred(&'a dyn JobSubmitter),
    /// Validate and create the wiki before recording the approval.
    Immediate(&'a dyn Provisioner),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSettings {
    /// Base URL of the wiki hosting the request queue.
    pub server: String,
    /// Farm domain; `<name>.<subdomain>` URLs imply a database name.
    pub subdomain: String,
    pub database_suffix: String,
}

impl RequestSettings {
    pub fn queue_url(&self, id: RequestId) -> String {
        format!(
            "{}/wiki/Special:RequestWikiQueue/{id}",
            self.server.trim_end_matches('/')
        )
    }
}

pub struct RequestServices<'a> {
    pub store: &'a dyn RequestStore,
    pub users: &'a dyn UserDirectory,
    /// `None` when notifications are switched off.
    pub notifier: Option<&'a dyn Notifier>,
    pub approval: ApprovalBackend<'a>,
    pub audit: &'a dyn AuditLog,
    pub clock: &'a dyn Clock,
    pub settings: RequestSettings,
}

impl WikiRequest {
    /// Hydrate request `id`, or start an empty request when `id` is `None`.
    pub fn load(services: &RequestServices<'_>, id: Option<RequestId>) -> RequestResult<Self> {
        let Some(id) = id else {
            return Ok(Self::empty());
        };
        let stored = services
            .store
            .select_one(id)?
            .ok_or(RequestError::NotFound(id))?;
        let requester = services.users.lookup_by_id(stored.row.requester)?;

        let mut comments = Vec::new();
        let mut involved_users = BTreeMap::new();
        for row in services.store.select_comments(id)? {
            let author = match involved_users.get(&row.author) {
                Some(known) => User::clone(known),
                None => services.users.lookup_by_id(row.author)?,
            };
            involved_users
                .entry(author.id)
                .or_insert_with(|| author.clone());
            comments.push(Comment {
                timestamp: row.timestamp,
                author,
                text: row.text,
            });
        }

        Ok(Self {
            id: Some(id),
            details: stored.row.details,
            requester: Some(requester),
            status: stored.row.status,
            comments,
            involved_users,
            timestamp: Some(stored.row.timestamp),
        })
    }

    /// Persist the request, returning its identifier.
    ///
    /// New requests are rejected when they repeat the sitename, dbname or
    /// description of a request still in review. The dbname is derived from a
    /// farm subdomain URL before that check, so a derived name that clashes
    /// with an open request is rejected too. A request must end up with a
    /// non-blank dbname.
    pub fn save(&mut self, services: &RequestServices<'_>) -> RequestResult<RequestId> {
        let requester = self
            .requester
            .as_ref()
            .ok_or(RequestError::Incomplete("request has no requester"))?
            .id;

        let settings = &services.settings;
        if let Some(dbname) = derive_dbname(
            &self.details.url,
            &settings.subdomain,
            &settings.database_suffix,
        ) {
            self.details.dbname = dbname;
        }
        if self.details.dbname.trim().is_empty() {
            return Err(RequestError::Incomplete("request has no database name"));
        }

        if self.id.is_none() {
            let open = services.store.select_open_requests()?;
            if let Some((field, existing)) = find_conflict(&open, &self.details) {
                tracing::warn!(%field, %existing, sitename = %self.details.sitename, "rejected duplicate request");
                return Err(RequestError::Conflict { field, existing });
            }
        }

        let timestamp = self.timestamp.unwrap_or_else(|| services.clock.now());
        let row = RequestRow {
            details: self.details.clone(),
            requester,
            status: self.status,
            timestamp,
        };
        let id = services.store.upsert(self.id, &row)?;
        if self.id.is_none() {
            tracing::info!(request = %id, sitename = %self.details.sitename, "filed wiki request");
        }
        self.id = Some(id);
        self.timestamp = Some(timestamp);
        Ok(id)
    }

    /// Append a comment and tell everyone already involved about it.
    pub fn add_comment(
        &mut self,
        services: &RequestServices<'_>,
        text: &str,
        author: &User,
    ) -> RequestResult<()> {
        let id = self.id.ok_or(RequestError::NotPersisted)?;
        let timestamp = services.clock.now();
        services.store.insert_comment(&CommentRow {
            request: id,
            text: text.to_string(),
            timestamp,
            author: author.id,
        })?;
        self.comments.insert(
            0,
            Comment {
                timestamp,
                author: author.clone(),
                text: text.to_string(),
            },
        );

        self.send_notification(services, NotificationKind::Comment, text, timestamp)?;
        self.involved_users
            .entry(author.id)
            .or_insert_with(|| author.clone());
        tracing::debug!(request = %id, author = %author.name, "added comment");
        Ok(())
    }

    pub fn approve(
        &mut self,
        services: &RequestServices<'_>,
        approver: &User,
        reason: Option<&str>,
    ) -> RequestResult<()> {
        let id = self.id.ok_or(RequestError::NotPersisted)?;
        let requester = self
            .requester
            .clone()
            .ok_or(RequestError::Incomplete("request has no requester"))?;

        match services.approval {
            ApprovalBackend::Deferred(jobs) => {
                jobs.submit(&self.job_snapshot(&requester, approver))?;
                self.save_with_status(services, RequestStatus::Approved)?;
                self.add_comment(
                    services,
                    &approval_comment(DEFERRED_APPROVAL_COMMENT, reason),
                    approver,
                )?;
                self.log(services, approver, AuditAction::RequestAccept)?;
                tracing::info!(request = %id, approver = %approver.name, "approved request, creation queued");
            }
            ApprovalBackend::Immediate(provisioner) => {
                let request = self.provision_request(id, &requester, approver);
                provisioner
                    .validate_name(&request.dbname)
                    .and_then(|()| provisioner.provision(&request))
                    .map_err(|err| {
                        let message = format!("{err:#}");
                        tracing::warn!(request = %id, dbname = %request.dbname, error = %message, "wiki creation failed");
                        RequestError::Provisioning(message)
                    })?;
                self.save_with_status(services, RequestStatus::Approved)?;
                self.add_comment(
                    services,
                    &approval_comment(IMMEDIATE_APPROVAL_COMMENT, reason),
                    approver,
                )?;
                tracing::info!(request = %id, approver = %approver.name, "approved request, wiki created");
            }
        }
        Ok(())
    }

    pub fn decline(
        &mut self,
        services: &RequestServices<'_>,
        reason: &str,
        decliner: &User,
    ) -> RequestResult<()> {
        let id = self.save_with_status(services, RequestStatus::Declined)?;
        self.add_comment(services, reason, decliner)?;
        self.send_notification(
            services,
            NotificationKind::Declined,
            reason,
            services.clock.now(),
        )?;
        self.log(services, decliner, AuditAction::RequestDecline)?;
        tracing::info!(request = %id, status = %self.status, decliner = %decliner.name, "declined request");
        Ok(())
    }

    /// Put the request back in review. `log_comment` adds a fixed
    /// "Updated request." comment.
    pub fn reopen(
        &mut self,
        services: &RequestServices<'_>,
        actor: &User,
        log_comment: bool,
    ) -> RequestResult<()> {
        let id = self.save_with_status(services, RequestStatus::InReview)?;
        if log_comment {
            self.add_comment(services, UPDATED_REQUEST_COMMENT, actor)?;
        }
        tracing::info!(request = %id, status = %self.status, actor = %actor.name, "reopened request");
        Ok(())
    }

    /// Save under the transitioned status. The previous status is kept when
    /// the save fails.
    fn save_with_status(
        &mut self,
        services: &RequestServices<'_>,
        requested: RequestStatus,
    ) -> RequestResult<RequestId> {
        let previous = self.status;
        self.status = transition(previous, requested);
        let saved = self.save(services);
        if saved.is_err() {
            self.status = previous;
        }
        saved
    }

    fn send_notification(
        &self,
        services: &RequestServices<'_>,
        kind: NotificationKind,
        text: &str,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> RequestResult<()> {
        let Some(notifier) = services.notifier else {
            return Ok(());
        };
        let id = self.id.ok_or(RequestError::NotPersisted)?;
        let recipients: Vec<User> = self.involved_users.values().cloned().collect();
        if recipients.is_empty() {
            return Ok(());
        }
        notifier.notify(
            &Notification {
                kind,
                request: id,
                request_url: services.settings.queue_url(id),
                text: text.to_string(),
                notify_agent: true,
                timestamp,
            },
            &recipients,
        )?;
        Ok(())
    }

    fn log(
        &self,
        services: &RequestServices<'_>,
        actor: &User,
        action: AuditAction,
    ) -> RequestResult<()> {
        let target = self.id.ok_or(RequestError::NotPersisted)?;
        services.audit.record(&AuditEntry {
            actor: actor.clone(),
            action,
            target,
            timestamp: services.clock.now(),
        })?;
        Ok(())
    }

    fn job_snapshot(&self, requester: &User, creator: &User) -> CreateWikiJob {
        CreateWikiJob {
            id: self.id,
            dbname: self.details.dbname.clone(),
            sitename: self.details.sitename.clone(),
            language: self.details.language.clone(),
            description: self.details.description.clone(),
            private: self.details.private,
            category: self.details.category.clone(),
            requester: requester.name.clone(),
            creator: creator.name.clone(),
        }
    }

    fn provision_request(&self, id: RequestId, requester: &User, creator: &User) -> ProvisionRequest {
        ProvisionRequest {
            dbname: self.details.dbname.clone(),
            sitename: self.details.sitename.clone(),
            language: self.details.language.clone(),
            description: self.details.description.clone(),
            private: self.details.private,
            category: self.details.category.clone(),
            requester: requester.name.clone(),
            creator: creator.name.clone(),
            reason: requested_link(id),
        }
    }
}

fn approval_comment(prefix: &str, reason: Option<&str>) -> String {
    match reason.map(str::trim).filter(|reason| !reason.is_empty()) {
        Some(reason) => format!("{prefix} {reason}"),
        None => prefix.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use anyhow::bail;
    use rusqlite::Connection;
    use tempfile::TempDir;

    use super::*;
    use crate::audit::SqliteAuditLog;
    use crate::clock::testing::StepClock;
    use crate::db::count_query;
    use crate::error::ConflictField;
    use crate::jobs::SqliteJobQueue;
    use crate::migrate::testing::migrated_connection;
    use crate::notify::SqliteOutbox;
    use crate::request::RequestDetails;
    use crate::store::SqliteRequestStore;
    use crate::users::SqliteUserDirectory;

    #[derive(Default)]
    struct RecordingProvisioner {
        reject_name: Option<&'static str>,
        fail_provision: Option<&'static str>,
        provisioned: RefCell<Vec<ProvisionRequest>>,
    }

    impl Provisioner for RecordingProvisioner {
        fn validate_name(&self, _dbname: &str) -> anyhow::Result<()> {
            if let Some(message) = self.reject_name {
                bail!("{message}");
            }
            Ok(())
        }

        fn provision(&self, request: &ProvisionRequest) -> anyhow::Result<()> {
            if let Some(message) = self.fail_provision {
                bail!("{message}");
            }
            self.provisioned.borrow_mut().push(request.clone());
            Ok(())
        }
    }

    #[derive(Clone, Copy)]
    enum Policy {
        Deferred,
        Immediate,
    }

    struct Fixture {
        _temp: TempDir,
        connection: Connection,
        clock: StepClock,
        provisioner: RecordingProvisioner,
        notifications: bool,
    }

    impl Fixture {
        fn new() -> Self {
            let (temp, connection) = migrated_connection();
            Self {
                _temp: temp,
                connection,
                clock: StepClock::default(),
                provisioner: RecordingProvisioner::default(),
                notifications: true,
            }
        }

        fn user(&self, name: &str) -> User {
            SqliteUserDirectory::new(&self.connection)
                .ensure_user(name)
                .expect("ensure user")
        }

        fn count(&self, sql: &str) -> usize {
            count_query(&self.connection, sql).expect("count")
        }

        fn run<R>(&self, policy: Policy, body: impl FnOnce(&RequestServices<'_>) -> R) -> R {
            let store = SqliteRequestStore::new(&self.connection);
            let users = SqliteUserDirectory::new(&self.connection);
            let outbox = SqliteOutbox::new(&self.connection);
            let jobs = SqliteJobQueue::new(&self.connection, &self.clock);
            let audit = SqliteAuditLog::new(&self.connection);
            let services = RequestServices {
                store: &store,
                users: &users,
                notifier: if self.notifications {
                    Some(&outbox as &dyn Notifier)
                } else {
                    None
                },
                approval: match policy {
                    Policy::Deferred => ApprovalBackend::Deferred(&jobs),
                    Policy::Immediate => ApprovalBackend::Immediate(&self.provisioner),
                },
                audit: &audit,
                clock: &self.clock,
                settings: RequestSettings {
                    server: "https://meta.example.org/".to_string(),
                    subdomain: "example.org".to_string(),
                    database_suffix: "wiki".to_string(),
                },
            };
            body(&services)
        }
    }

    fn details(sitename: &str, dbname: &str, description: &str) -> RequestDetails {
        RequestDetails {
            dbname: dbname.to_string(),
            sitename: sitename.to_string(),
            url: format!("{dbname}.hosted.example.net"),
            language: "en".to_string(),
            category: "uncategorised".to_string(),
            description: description.to_string(),
            private: false,
            visibility: 0,
        }
    }

    fn saved_request(services: &RequestServices<'_>, requester: &User) -> WikiRequest {
        let mut request = WikiRequest::new(
            details("Test Wiki", "testwiki", "please"),
            requester.clone(),
        );
        request.save(services).expect("save");
        request
    }

    #[test]
    fn load_without_id_is_empty_and_in_review() {
        let fixture = Fixture::new();
        fixture.run(Policy::Immediate, |services| {
            let request = WikiRequest::load(services, None).expect("load");
            assert_eq!(request.status(), RequestStatus::InReview);
            assert!(request.comments().is_empty());
            assert_eq!(request.id(), None);
            assert!(request.requester().is_none());
        });
    }

    #[test]
    fn load_unknown_id_is_not_found() {
        let fixture = Fixture::new();
        fixture.run(Policy::Immediate, |services| {
            let error = WikiRequest::load(services, Some(RequestId(404))).expect_err("missing");
            assert!(matches!(error, RequestError::NotFound(RequestId(404))));
        });
    }

    #[test]
    fn save_without_requester_is_incomplete() {
        let fixture = Fixture::new();
        fixture.run(Policy::Immediate, |services| {
            let mut request = WikiRequest::load(services, None).expect("load");
            *request.details_mut() = details("Test Wiki", "testwiki", "please");
            let error = request.save(services).expect_err("no requester");
            assert!(matches!(error, RequestError::Incomplete(_)));
        });
    }

    #[test]
    fn duplicate_open_sitename_conflicts() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        fixture.run(Policy::Immediate, |services| {
            let mut first = WikiRequest::new(
                details("Test Wiki", "testwiki", "please"),
                alice.clone(),
            );
            let id = first.save(services).expect("save first");
            assert_eq!(first.id(), Some(id));
            assert!(first.timestamp().is_some());

            let mut second =
                WikiRequest::new(details("Test Wiki", "otherwiki", "another"), alice.clone());
            let error = second.save(services).expect_err("conflict");
            assert!(matches!(
                error,
                RequestError::Conflict {
                    field: ConflictField::Sitename,
                    existing
                } if existing == id
            ));
            assert_eq!(second.id(), None);
            assert_eq!(second.timestamp(), None);
        });
        assert_eq!(fixture.count("SELECT COUNT(*) FROM cw_requests"), 1);
    }

    #[test]
    fn duplicate_dbname_or_description_conflicts() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        fixture.run(Policy::Immediate, |services| {
            saved_request(services, &alice);

            let mut same_db = WikiRequest::new(details("Other", "testwiki", "x"), alice.clone());
            assert!(matches!(
                same_db.save(services),
                Err(RequestError::Conflict {
                    field: ConflictField::Dbname,
                    ..
                })
            ));

            let mut same_text =
                WikiRequest::new(details("Other", "otherwiki", "please"), alice.clone());
            assert!(matches!(
                same_text.save(services),
                Err(RequestError::Conflict {
                    field: ConflictField::Description,
                    ..
                })
            ));
        });
    }

    #[test]
    fn blank_dbname_is_incomplete_not_a_conflict() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        fixture.run(Policy::Immediate, |services| {
            for (sitename, description) in [("First", "one"), ("Second", "two")] {
                let mut request = WikiRequest::new(
                    RequestDetails {
                        url: format!("{}.elsewhere.net", sitename.to_lowercase()),
                        ..details(sitename, " ", description)
                    },
                    alice.clone(),
                );
                let error = request.save(services).expect_err("no dbname");
                assert!(matches!(
                    error,
                    RequestError::Incomplete("request has no database name")
                ));
                assert_eq!(request.id(), None);
            }

            let mut named = WikiRequest::new(details("Third", "thirdwiki", "three"), alice.clone());
            named.save(services).expect("save named");
        });
        assert_eq!(fixture.count("SELECT COUNT(*) FROM cw_requests"), 1);
    }

    #[test]
    fn saved_requests_skip_duplicate_check() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        fixture.run(Policy::Immediate, |services| {
            saved_request(services, &alice);
            let mut other =
                WikiRequest::new(details("Other", "otherwiki", "another"), alice.clone());
            let id = other.save(services).expect("save other");
            let created = other.timestamp();

            other.details_mut().sitename = "Test Wiki".to_string();
            assert_eq!(other.save(services).expect("resave"), id);
            assert_eq!(other.timestamp(), created);

            let reloaded = WikiRequest::load(services, Some(id)).expect("reload");
            assert_eq!(reloaded.details().sitename, "Test Wiki");
            assert_eq!(reloaded.timestamp(), created);
            assert_eq!(reloaded.requester(), Some(&alice));
        });
    }

    #[test]
    fn save_derives_dbname_from_farm_subdomain() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        fixture.run(Policy::Immediate, |services| {
            let mut request = WikiRequest::new(
                RequestDetails {
                    url: "foo.example.org".to_string(),
                    ..details("Foo", "", "foo please")
                },
                alice.clone(),
            );
            let id = request.save(services).expect("save");
            assert_eq!(request.details().dbname, "foowiki");
            let reloaded = WikiRequest::load(services, Some(id)).expect("reload");
            assert_eq!(reloaded.details().dbname, "foowiki");
        });
    }

    #[test]
    fn comments_accumulate_newest_first() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        let bob = fixture.user("Bob");
        let id = fixture.run(Policy::Immediate, |services| {
            let mut request = saved_request(services, &alice);
            let mut expected = Vec::new();
            for (index, author) in [&alice, &bob, &alice].into_iter().enumerate() {
                let at = fixture.clock.peek();
                let text = format!("comment {index}");
                request
                    .add_comment(services, &text, author)
                    .expect("comment");
                expected.insert(0, (at, author.clone(), text));
            }

            let in_memory: Vec<_> = request
                .comments()
                .iter()
                .map(|c| (c.timestamp, c.author.clone(), c.text.clone()))
                .collect();
            assert_eq!(in_memory, expected);

            let reloaded = WikiRequest::load(services, request.id()).expect("reload");
            let persisted: Vec<_> = reloaded
                .comments()
                .iter()
                .map(|c| (c.timestamp, c.author.clone(), c.text.clone()))
                .collect();
            assert_eq!(persisted, expected);
            let involved: Vec<&User> = reloaded.involved_users().collect();
            assert_eq!(involved, vec![&alice, &bob]);
            assert_eq!(reloaded.status(), RequestStatus::InReview);
            request.id().expect("saved")
        });
        assert_eq!(
            fixture.count(&format!(
                "SELECT COUNT(*) FROM cw_comments WHERE cw_id = {}",
                id.0
            )),
            3
        );
    }

    #[test]
    fn comment_on_unsaved_request_is_rejected() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        fixture.run(Policy::Immediate, |services| {
            let mut request =
                WikiRequest::new(details("Test Wiki", "testwiki", "please"), alice.clone());
            let error = request
                .add_comment(services, "hello", &alice)
                .expect_err("unsaved");
            assert!(matches!(error, RequestError::NotPersisted));
        });
    }

    #[test]
    fn comment_notifications_reach_earlier_participants() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        let bob = fixture.user("Bob");
        fixture.run(Policy::Immediate, |services| {
            let mut request = saved_request(services, &alice);
            request
                .add_comment(services, "first", &alice)
                .expect("comment");
            request.add_comment(services, "reply", &bob).expect("comment");
        });

        let outbox = SqliteOutbox::new(&fixture.connection);
        let to_alice = outbox.for_recipient(alice.id).expect("alice");
        assert_eq!(to_alice.len(), 1);
        assert_eq!(to_alice[0].kind, "request-comment");
        assert_eq!(to_alice[0].text, "reply");
        assert_eq!(
            to_alice[0].request_url,
            format!(
                "https://meta.example.org/wiki/Special:RequestWikiQueue/{}",
                to_alice[0].request
            )
        );
        assert!(outbox.for_recipient(bob.id).expect("bob").is_empty());
    }

    #[test]
    fn disabled_notifications_write_nothing() {
        let mut fixture = Fixture::new();
        fixture.notifications = false;
        let alice = fixture.user("Alice");
        fixture.run(Policy::Immediate, |services| {
            let mut request = saved_request(services, &alice);
            request.add_comment(services, "one", &alice).expect("comment");
            request.add_comment(services, "two", &alice).expect("comment");
            request.decline(services, "no", &alice).expect("decline");
        });
        assert_eq!(fixture.count("SELECT COUNT(*) FROM cw_notifications"), 0);
    }

    #[test]
    fn immediate_approval_creates_wiki_and_comments() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        let steward = fixture.user("Steward");
        fixture.run(Policy::Immediate, |services| {
            let mut request = saved_request(services, &alice);
            let id = request.id().expect("saved");
            request
                .approve(services, &steward, Some("looks good"))
                .expect("approve");
            assert_eq!(request.status(), RequestStatus::Approved);

            let reloaded = WikiRequest::load(services, Some(id)).expect("reload");
            assert_eq!(reloaded.status(), RequestStatus::Approved);
            assert_eq!(reloaded.comments().len(), 1);
            assert_eq!(
                reloaded.comments()[0].text,
                "Request approved and wiki created. looks good"
            );
            assert!(
                reloaded.comments()[0]
                    .text
                    .starts_with("Request approved and wiki created.")
            );
            assert_eq!(reloaded.comments()[0].author, steward);
        });

        let provisioned = fixture.provisioner.provisioned.borrow();
        assert_eq!(provisioned.len(), 1);
        assert_eq!(provisioned[0].dbname, "testwiki");
        assert_eq!(provisioned[0].requester, "Alice");
        assert_eq!(provisioned[0].creator, "Steward");
        assert!(provisioned[0].reason.starts_with("[[Special:RequestWikiQueue/"));
        assert_eq!(fixture.count("SELECT COUNT(*) FROM farm_jobs"), 0);
    }

    #[test]
    fn immediate_approval_without_reason_has_no_trailing_space() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        fixture.run(Policy::Immediate, |services| {
            let mut request = saved_request(services, &alice);
            request.approve(services, &alice, None).expect("approve");
            assert_eq!(
                request.comments()[0].text,
                "Request approved and wiki created."
            );
        });
    }

    #[test]
    fn rejected_name_leaves_request_untouched() {
        let mut fixture = Fixture::new();
        fixture.provisioner.reject_name = Some("database testwiki already exists");
        let alice = fixture.user("Alice");
        let steward = fixture.user("Steward");
        fixture.run(Policy::Immediate, |services| {
            let mut request = saved_request(services, &alice);
            let error = request
                .approve(services, &steward, None)
                .expect_err("rejected");
            match error {
                RequestError::Provisioning(message) => {
                    assert_eq!(message, "database testwiki already exists")
                }
                other => panic!("unexpected error: {other}"),
            }
            assert_eq!(request.status(), RequestStatus::InReview);
            assert!(request.comments().is_empty());

            let reloaded = WikiRequest::load(services, request.id()).expect("reload");
            assert_eq!(reloaded.status(), RequestStatus::InReview);
            assert!(reloaded.comments().is_empty());
        });
        assert!(fixture.provisioner.provisioned.borrow().is_empty());
    }

    #[test]
    fn failed_provisioning_surfaces_message() {
        let mut fixture = Fixture::new();
        fixture.provisioner.fail_provision = Some("cluster unavailable");
        let alice = fixture.user("Alice");
        fixture.run(Policy::Immediate, |services| {
            let mut request = saved_request(services, &alice);
            let error = request.approve(services, &alice, None).expect_err("failed");
            assert!(error.to_string().contains("cluster unavailable"));
            assert_eq!(request.status(), RequestStatus::InReview);
        });
        assert_eq!(fixture.count("SELECT COUNT(*) FROM cw_comments"), 0);
    }

    #[test]
    fn deferred_approval_queues_snapshot_and_logs() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        let steward = fixture.user("Steward");
        let id = fixture.run(Policy::Deferred, |services| {
            let mut request = saved_request(services, &alice);
            request
                .approve(services, &steward, Some("welcome"))
                .expect("approve");
            assert_eq!(request.status(), RequestStatus::Approved);
            assert_eq!(request.comments()[0].text, "Request approved. welcome");
            request.id().expect("saved")
        });

        let jobs = SqliteJobQueue::new(&fixture.connection, &fixture.clock)
            .list()
            .expect("jobs");
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0].job;
        assert_eq!(job.id, Some(id));
        assert_eq!(job.dbname, "testwiki");
        assert_eq!(job.sitename, "Test Wiki");
        assert_eq!(job.requester, "Alice");
        assert_eq!(job.creator, "Steward");
        assert!(fixture.provisioner.provisioned.borrow().is_empty());

        let log = SqliteAuditLog::new(&fixture.connection)
            .recent(10)
            .expect("log");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, "requestaccept");
        assert_eq!(log[0].actor, steward.id);
        assert_eq!(log[0].params["4::id"], format!("#{id}"));
    }

    #[test]
    fn decline_comments_notifies_and_logs() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        let steward = fixture.user("Steward");
        fixture.run(Policy::Immediate, |services| {
            let mut request = saved_request(services, &alice);
            request
                .add_comment(services, "any update?", &alice)
                .expect("comment");
            request
                .decline(services, "Out of scope", &steward)
                .expect("decline");
            assert_eq!(request.status(), RequestStatus::Declined);
            assert_eq!(request.comments()[0].text, "Out of scope");

            let reloaded = WikiRequest::load(services, request.id()).expect("reload");
            assert_eq!(reloaded.status(), RequestStatus::Declined);
        });

        let outbox = SqliteOutbox::new(&fixture.connection);
        let kinds: Vec<String> = outbox
            .for_recipient(alice.id)
            .expect("alice")
            .into_iter()
            .map(|n| n.kind)
            .collect();
        assert_eq!(kinds, vec!["request-declined", "request-comment"]);
        let to_steward = outbox.for_recipient(steward.id).expect("steward");
        assert_eq!(to_steward.len(), 1);
        assert_eq!(to_steward[0].kind, "request-declined");

        let log = SqliteAuditLog::new(&fixture.connection)
            .recent(10)
            .expect("log");
        assert_eq!(log[0].action, "requestdecline");
    }

    #[test]
    fn reopen_returns_declined_request_to_review() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        fixture.run(Policy::Immediate, |services| {
            let mut request = saved_request(services, &alice);
            request.decline(services, "needs detail", &alice).expect("decline");
            request.reopen(services, &alice, true).expect("reopen");
            assert_eq!(request.status(), RequestStatus::InReview);
            assert_eq!(request.comments()[0].text, UPDATED_REQUEST_COMMENT);

            request.reopen(services, &alice, false).expect("quiet reopen");
            assert_eq!(request.comments().len(), 2);
        });
    }

    #[test]
    fn failed_save_keeps_previous_status() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        fixture.run(Policy::Immediate, |services| {
            let mut request = saved_request(services, &alice);
            request.details_mut().dbname = String::new();
            let error = request
                .decline(services, "nope", &alice)
                .expect_err("unsavable");
            assert!(matches!(error, RequestError::Incomplete(_)));
            assert_eq!(request.status(), RequestStatus::InReview);

            request.details_mut().dbname = "testwiki".to_string();
            request.decline(services, "nope", &alice).expect("decline");
            request.details_mut().dbname = String::new();
            request
                .reopen(services, &alice, true)
                .expect_err("unsavable");
            assert_eq!(request.status(), RequestStatus::Declined);
            assert_eq!(request.comments().len(), 1);

            let reloaded = WikiRequest::load(services, request.id()).expect("reload");
            assert_eq!(reloaded.status(), RequestStatus::Declined);
        });
    }

    #[test]
    fn approval_is_sticky() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        let steward = fixture.user("Steward");
        fixture.run(Policy::Immediate, |services| {
            let mut request = saved_request(services, &alice);
            request.approve(services, &steward, None).expect("approve");

            request
                .decline(services, "changed my mind", &steward)
                .expect("decline");
            assert_eq!(request.status(), RequestStatus::Approved);
            request.reopen(services, &steward, true).expect("reopen");
            assert_eq!(request.status(), RequestStatus::Approved);

            let reloaded = WikiRequest::load(services, request.id()).expect("reload");
            assert_eq!(reloaded.status(), RequestStatus::Approved);
            assert_eq!(reloaded.comments().len(), 3);
        });
    }

    #[test]
    fn approve_requires_saved_request() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice");
        fixture.run(Policy::Deferred, |services| {
            let mut request =
                WikiRequest::new(details("Test Wiki", "testwiki", "please"), alice.clone());
            let error = request.approve(services, &alice, None).expect_err("unsaved");
            assert!(matches!(error, RequestError::NotPersisted));
        });
        assert_eq!(fixture.count("SELECT COUNT(*) FROM farm_jobs"), 0);
    }

    #[test]
    fn approval_comment_formatting() {
        assert_eq!(
            approval_comment("Request approved.", Some("  ")),
            "Request approved."
        );
        assert_eq!(
            approval_comment("Request approved.", Some("ok")),
            "Request approved. ok"
        );
    }
}
