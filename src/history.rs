//! The ordered, paginated list of jobs shown to the user.
//!
//! Every writer goes through [`History::update`], which locates an entry by
//! identity and either replaces it (provisional entry meeting its persisted
//! counterpart) or merges a newer observation into it. Merges that would move
//! a status backward are refused.

use crate::job::{Job, JobId, Kind, Status};
use std::collections::{HashMap, HashSet};

/// One page of jobs as returned by the gateway.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<Job>,
    pub total: u64,
    pub current: u32,
    pub size: u32,
    pub pages: u32,
    pub has_next: bool,
    pub has_previous: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    /// Last page merged into the container; 0 before the first load.
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub has_next: bool,
}

impl PageCursor {
    fn new(page_size: u32) -> Self {
        PageCursor {
            page: 0,
            page_size,
            total: 0,
            has_next: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// A newer observation was merged into the entry.
    Applied,
    /// A provisional entry was swapped for its persisted counterpart.
    Replaced,
    /// The observation would regress the entry's status and was dropped.
    Stale { current: Status, offered: Status },
    Missing,
}

#[derive(Debug, Clone)]
pub struct History {
    jobs: Vec<Job>,
    cursor: PageCursor,
    filter: Option<Kind>,
}

impl History {
    pub fn new(page_size: u32) -> Self {
        History {
            jobs: Vec::new(),
            cursor: PageCursor::new(page_size),
            filter: None,
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn cursor(&self) -> PageCursor {
        self.cursor
    }

    pub fn filter(&self) -> Option<Kind> {
        self.filter
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    pub fn position(&self, id: &JobId) -> Option<usize> {
        self.jobs.iter().position(|j| &j.id == id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.position(id).is_some()
    }

    /// Persisted ids of every entry still waiting on the server.
    pub fn in_progress(&self) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|j| !j.is_terminal())
            .filter_map(|j| j.id.as_persisted().map(str::to_string))
            .collect()
    }

    /// Insert at the head. Refuses an id that is already present.
    pub(crate) fn prepend(&mut self, job: Job) -> bool {
        if self.contains(&job.id) {
            return false;
        }
        self.jobs.insert(0, job);
        true
    }

    /// Apply `next` to the entry identified by `target`.
    ///
    /// When `next` carries a different identity (a provisional entry meeting
    /// its persisted counterpart) the entry is replaced in place. If the
    /// persisted id is already present elsewhere, the provisional entry is
    /// dropped and `next` is merged into the existing one instead.
    pub(crate) fn update(&mut self, target: &JobId, next: Job) -> Update {
        let Some(pos) = self.position(target) else {
            return Update::Missing;
        };

        if next.id == *target {
            return self.merge_at(pos, next);
        }

        match self.position(&next.id) {
            Some(existing) => {
                self.jobs.remove(pos);
                let existing = if existing > pos { existing - 1 } else { existing };
                self.merge_at(existing, next)
            }
            None => {
                self.jobs[pos] = next;
                Update::Replaced
            }
        }
    }

    fn merge_at(&mut self, pos: usize, next: Job) -> Update {
        let current = &mut self.jobs[pos];
        if !current.status.admits(next.status) {
            return Update::Stale {
                current: current.status,
                offered: next.status,
            };
        }
        current.absorb(next);
        Update::Applied
    }

    pub(crate) fn remove(&mut self, id: &JobId) -> Option<Job> {
        let pos = self.position(id)?;
        Some(self.jobs.remove(pos))
    }

    /// Remove every listed persisted id, returning the entries removed.
    pub(crate) fn remove_persisted(&mut self, ids: &[String]) -> Vec<Job> {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let (removed, kept): (Vec<Job>, Vec<Job>) = std::mem::take(&mut self.jobs)
            .into_iter()
            .partition(|j| j.id.as_persisted().is_some_and(|id| ids.contains(id)));
        self.jobs = kept;
        self.cursor.total = self.cursor.total.saturating_sub(removed.len() as u64);
        removed
    }

    /// Replace the contents with `page`, resetting the cursor.
    ///
    /// Provisional entries stay at the head because the server does not know
    /// about them yet. A record that is behind what the container already
    /// observed for the same id does not overwrite it. Returns the persisted
    /// ids that are no longer in the container.
    pub(crate) fn reset(&mut self, page: Page, page_size: u32, filter: Option<Kind>) -> Vec<String> {
        let (provisional, previous): (Vec<Job>, Vec<Job>) =
            std::mem::take(&mut self.jobs).into_iter().partition(|j| j.id.is_provisional());
        let mut previous: HashMap<JobId, Job> =
            previous.into_iter().map(|j| (j.id.clone(), j)).collect();

        self.jobs = provisional;
        let mut seen = HashSet::new();
        for record in page.records {
            if !seen.insert(record.id.clone()) {
                continue;
            }
            let job = match previous.remove(&record.id) {
                Some(mut known) => {
                    if known.status.admits(record.status) {
                        known.absorb(record);
                    }
                    known
                }
                None => record,
            };
            self.jobs.push(job);
        }

        self.cursor = PageCursor {
            page: page.current,
            page_size,
            total: page.total,
            has_next: page.has_next,
        };
        self.filter = filter;

        previous
            .into_keys()
            .filter_map(|id| id.as_persisted().map(str::to_string))
            .collect()
    }

    /// Append `page` after the existing entries, skipping ids already
    /// present. Returns the ids that were added.
    pub(crate) fn append(&mut self, page: Page) -> Vec<JobId> {
        let mut added = Vec::new();
        for record in page.records {
            if self.contains(&record.id) {
                continue;
            }
            added.push(record.id.clone());
            self.jobs.push(record);
        }
        self.cursor.page = page.current;
        self.cursor.total = page.total;
        self.cursor.has_next = page.has_next;
        added
    }

    /// Drop everything, provisional entries included.
    pub(crate) fn clear(&mut self) {
        self.jobs.clear();
        self.cursor = PageCursor::new(self.cursor.page_size);
    }
}
