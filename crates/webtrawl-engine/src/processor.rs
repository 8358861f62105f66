//! Scheme dispatch: pick the session variant for one frontier item.

use std::sync::Arc;

use tracing::warn;
use webtrawl_core::Result;

use crate::ftp::{FtpClient, FtpSession};
use crate::item::UrlItem;
use crate::session::{SessionContext, WebSession};

pub struct Processor {
    ctx: Arc<SessionContext>,
    ftp_client: FtpClient,
}

impl Processor {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            ftp_client: FtpClient::default(),
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Run the right session for the item's scheme. Always leaves the
    /// item in a terminal status unless the session itself errored.
    pub async fn process(&self, item: &mut UrlItem) -> Result<()> {
        match item.url_info().scheme() {
            "http" | "https" => WebSession::new(&self.ctx, item).process().await,
            "ftp" => {
                FtpSession::new(&self.ctx, self.ftp_client.clone(), item)
                    .process()
                    .await
            }
            scheme => {
                warn!(url = %item.url_info(), scheme, "no processor for scheme");
                item.skip()
            }
        }
    }
}
