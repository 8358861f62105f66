//! Transient handle for one claimed frontier row.

use std::sync::Arc;

use tracing::debug;
use webtrawl_core::{LinkType, Result, Status, UrlInfo, UrlRecord};

use crate::frontier::{AddDefaults, Frontier, UpdateFields};

/// A URL discovered while processing a parent document.
#[derive(Debug, Clone)]
pub struct ChildUrl {
    pub info: UrlInfo,
    pub inline: bool,
    pub link_type: Option<LinkType>,
    pub post_data: Option<Vec<u8>>,
    /// Re-queue even if the URL already has a row. The only path that
    /// deletes frontier rows.
    pub replace: bool,
}

impl ChildUrl {
    pub fn linked(info: UrlInfo, link_type: Option<LinkType>) -> Self {
        Self {
            info,
            inline: false,
            link_type,
            post_data: None,
            replace: false,
        }
    }

    pub fn inline(info: UrlInfo, link_type: Option<LinkType>) -> Self {
        Self {
            info,
            inline: true,
            link_type,
            post_data: None,
            replace: false,
        }
    }
}

/// Wraps one `in_progress` row plus its parsed URL for the duration of a
/// session. Terminal status updates go through here so the try counter is
/// bumped at most once per item lifetime.
pub struct UrlItem {
    frontier: Arc<Frontier>,
    info: UrlInfo,
    record: UrlRecord,
    processed: bool,
    try_count_incremented: bool,
}

impl UrlItem {
    pub fn new(frontier: Arc<Frontier>, info: UrlInfo, record: UrlRecord) -> Self {
        Self {
            frontier,
            info,
            record,
            processed: false,
            try_count_incremented: false,
        }
    }

    pub fn url_info(&self) -> &UrlInfo {
        &self.info
    }

    pub fn record(&self) -> &UrlRecord {
        &self.record
    }

    pub fn frontier(&self) -> &Arc<Frontier> {
        &self.frontier
    }

    /// True once a terminal status has been written back.
    pub fn is_processed(&self) -> bool {
        self.processed
    }

    /// Mark the row skipped without touching the try counter.
    pub fn skip(&mut self) -> Result<()> {
        debug!(url = %self.record.url, "skipping");
        self.frontier.update(
            &self.record.url,
            false,
            &UpdateFields {
                status: Some(Status::Skipped),
                ..Default::default()
            },
        )?;
        self.record.status = Status::Skipped;
        self.processed = true;
        Ok(())
    }

    /// Write a terminal status. A transition to `error` counts as a failed
    /// attempt and increments `try_count`, at most once per item.
    pub fn set_status(&mut self, status: Status) -> Result<()> {
        let increment = status == Status::Error && !self.try_count_incremented;
        if increment {
            self.try_count_incremented = true;
        }
        debug!(url = %self.record.url, status = status.as_str(), "marking url");
        self.frontier.update(
            &self.record.url,
            increment,
            &UpdateFields {
                status: Some(status),
                ..Default::default()
            },
        )?;
        if increment {
            self.record.try_count += 1;
        }
        self.record.status = status;
        self.processed = true;
        Ok(())
    }

    /// Update non-status fields on the row.
    pub fn set_value(&mut self, fields: UpdateFields) -> Result<()> {
        debug_assert!(fields.status.is_none(), "status goes through set_status");
        if let Some(code) = fields.status_code {
            self.record.status_code = Some(code);
        }
        if let Some(filename) = &fields.filename {
            self.record.filename = Some(filename.clone());
        }
        self.frontier.update(&self.record.url, false, &fields)
    }

    /// Enqueue URLs discovered in this item's document. Children sit one
    /// level deeper and inherit the top URL (or this URL when the item is
    /// itself a seed).
    pub fn add_child_urls(&self, children: &[ChildUrl]) -> Result<()> {
        let level = self.record.level + 1;
        let referrer = self.record.url.clone();
        let top_url = self
            .record
            .top_url
            .clone()
            .unwrap_or_else(|| self.record.url.clone());

        for child in children {
            if child.replace {
                self.frontier.remove_one(child.info.url())?;
            }
            self.frontier.add(
                &[child.info.url().to_string()],
                &AddDefaults {
                    level: Some(level),
                    referrer: Some(referrer.clone()),
                    top_url: Some(top_url.clone()),
                    inline: Some(child.inline),
                    link_type: child.link_type,
                    url_encoding: Some(child.info.encoding().to_string()),
                    post_data: child.post_data.clone(),
                },
            )?;
        }
        debug!(
            url = %self.record.url,
            count = children.len(),
            "enqueued child urls"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webtrawl_core::Error;

    fn item_for(url: &str) -> UrlItem {
        let frontier = Arc::new(Frontier::open_in_memory().unwrap());
        frontier
            .add(&[url.to_string()], &AddDefaults::default())
            .unwrap();
        let record = frontier
            .get_and_update(Status::Todo, Status::InProgress, None)
            .unwrap();
        let info = UrlInfo::parse(url).unwrap();
        UrlItem::new(frontier, info, record)
    }

    #[test]
    fn error_status_increments_try_count_once() {
        let mut item = item_for("http://example.com/");
        item.set_status(Status::Error).unwrap();
        item.set_status(Status::Error).unwrap();
        assert_eq!(
            item.frontier().get("http://example.com/").unwrap().try_count,
            1
        );
    }

    #[test]
    fn done_status_leaves_try_count_alone() {
        let mut item = item_for("http://example.com/");
        item.set_status(Status::Done).unwrap();
        let record = item.frontier().get("http://example.com/").unwrap();
        assert_eq!(record.try_count, 0);
        assert_eq!(record.status, Status::Done);
        assert!(item.is_processed());
    }

    #[test]
    fn children_inherit_depth_and_top_url() {
        let item = item_for("http://example.com/");
        let child = ChildUrl::linked(
            UrlInfo::parse("http://example.com/a").unwrap(),
            Some(LinkType::Html),
        );
        let media = ChildUrl::inline(
            UrlInfo::parse("http://example.com/b.png").unwrap(),
            Some(LinkType::Media),
        );
        item.add_child_urls(&[child, media]).unwrap();

        let a = item.frontier().get("http://example.com/a").unwrap();
        assert_eq!(a.level, 1);
        assert_eq!(a.referrer.as_deref(), Some("http://example.com/"));
        assert_eq!(a.top_url.as_deref(), Some("http://example.com/"));
        assert!(!a.inline);
        assert_eq!(a.link_type, Some(LinkType::Html));

        let b = item.frontier().get("http://example.com/b.png").unwrap();
        assert!(b.inline);
        assert_eq!(b.link_type, Some(LinkType::Media));
    }

    #[test]
    fn replace_requeues_a_finished_row() {
        let mut item = item_for("http://example.com/");
        let child_url = "http://example.com/a";
        item.add_child_urls(&[ChildUrl::linked(
            UrlInfo::parse(child_url).unwrap(),
            None,
        )])
        .unwrap();
        item.frontier()
            .update(
                child_url,
                false,
                &UpdateFields {
                    status: Some(Status::Done),
                    ..Default::default()
                },
            )
            .unwrap();

        // Plain re-add is a no-op on status.
        item.add_child_urls(&[ChildUrl::linked(
            UrlInfo::parse(child_url).unwrap(),
            None,
        )])
        .unwrap();
        assert_eq!(item.frontier().get(child_url).unwrap().status, Status::Done);

        // Replace is the one way back onto the queue.
        let mut replace = ChildUrl::linked(UrlInfo::parse(child_url).unwrap(), None);
        replace.replace = true;
        item.add_child_urls(&[replace]).unwrap();
        assert_eq!(item.frontier().get(child_url).unwrap().status, Status::Todo);

        let _ = item.set_status(Status::Done);
        assert!(matches!(
            item.frontier().get("http://example.com/missing"),
            Err(Error::NotFound)
        ));
    }
}
