use futures::channel::mpsc::UnboundedSender;
use log::warn;

use crate::{primitives::Epoch, status::ExplainedAttesterSlashing, AttestationRecord};

pub enum AttestationToSlasher {
    Attestation(AttestationRecord),
}

impl AttestationToSlasher {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            warn!("send to slasher failed because the receiver was dropped");
        }
    }
}

pub enum ValidatorToSlasher {
    Epoch(Epoch),
}

impl ValidatorToSlasher {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            warn!("send to slasher failed because the receiver was dropped");
        }
    }
}

#[derive(PartialEq, Eq, Debug)]
pub enum SlasherToValidator {
    AttesterSlashing(ExplainedAttesterSlashing),
}

impl SlasherToValidator {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            warn!("send to validator failed because the receiver was dropped");
        }
    }
}
