//! Tear-down of every resource the operator owns for a domain.

use crate::kubernetes::KubernetesFacade;
use crate::steps::resources::delete_domain_resources;
use crate::types::Result;
use crate::work::{NextAction, Packet, Step};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct DeleteDomainStep {
    facade: Arc<dyn KubernetesFacade>,
}

impl DeleteDomainStep {
    pub fn new(facade: Arc<dyn KubernetesFacade>) -> Arc<Self> {
        Arc::new(Self { facade })
    }
}

#[async_trait]
impl Step for DeleteDomainStep {
    fn name(&self) -> &str {
        "DeleteDomain"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        info!(
            namespace = info.namespace(),
            domain_uid = info.domain_uid(),
            "deleting domain resources"
        );
        delete_domain_resources(self.facade.as_ref(), &info).await?;
        Ok(NextAction::Continue)
    }
}
