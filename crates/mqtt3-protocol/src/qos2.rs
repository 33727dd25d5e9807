//! Decision tables for the `QoS` 2 handshake.
//!
//! The functions are pure: they look at the acknowledgment that arrived and the
//! state of the matching table entry, and say what the engine has to do.

use crate::session::inflight::AwaitingAck;
use crate::QoS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnknownPacketId,
    QoSMismatch,
    UnexpectedState,
}

impl IgnoreReason {
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::UnknownPacketId => "no in-flight message with this identifier",
            Self::QoSMismatch => "in-flight message has a different QoS",
            Self::UnexpectedState => "in-flight message is not waiting for this packet",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS2Action {
    SendPubRec { packet_id: u16 },
    SendPubRel { packet_id: u16 },
    SendPubComp { packet_id: u16 },
    TrackIncoming { packet_id: u16 },
    ReplaceIncoming { packet_id: u16 },
    AwaitPubComp { packet_id: u16 },
    DeliverMessage { packet_id: u16 },
    ReleaseIncoming { packet_id: u16 },
    CompleteFlow { packet_id: u16 },
    Ignore { packet_id: u16, reason: IgnoreReason },
}

/// State of the table entry an acknowledgment was matched against.
pub type EntryState = Option<(QoS, AwaitingAck)>;

fn check_entry(
    packet_id: u16,
    entry: EntryState,
    expected: AwaitingAck,
) -> Result<(), QoS2Action> {
    match entry {
        None => Err(QoS2Action::Ignore {
            packet_id,
            reason: IgnoreReason::UnknownPacketId,
        }),
        Some((qos, _)) if qos != QoS::ExactlyOnce => Err(QoS2Action::Ignore {
            packet_id,
            reason: IgnoreReason::QoSMismatch,
        }),
        Some((_, awaiting)) if awaiting != expected => Err(QoS2Action::Ignore {
            packet_id,
            reason: IgnoreReason::UnexpectedState,
        }),
        Some(_) => Ok(()),
    }
}

/// A `QoS` 2 PUBLISH is stored until PUBREL; a resend before then replaces the
/// stored copy so only one delivery can ever happen.
#[must_use]
pub fn handle_incoming_publish_qos2(packet_id: u16, has_pending: bool) -> Vec<QoS2Action> {
    let track = if has_pending {
        QoS2Action::ReplaceIncoming { packet_id }
    } else {
        QoS2Action::TrackIncoming { packet_id }
    };
    vec![track, QoS2Action::SendPubRec { packet_id }]
}

#[must_use]
pub fn handle_incoming_pubrec(packet_id: u16, entry: EntryState) -> Vec<QoS2Action> {
    if let Err(ignore) = check_entry(packet_id, entry, AwaitingAck::PubRec) {
        return vec![ignore];
    }
    vec![
        QoS2Action::SendPubRel { packet_id },
        QoS2Action::AwaitPubComp { packet_id },
    ]
}

#[must_use]
pub fn handle_incoming_pubcomp(packet_id: u16, entry: EntryState) -> Vec<QoS2Action> {
    if let Err(ignore) = check_entry(packet_id, entry, AwaitingAck::PubComp) {
        return vec![ignore];
    }
    vec![QoS2Action::CompleteFlow { packet_id }]
}

/// PUBCOMP goes out before delivery so a slow sink cannot hold up the peer.
///
/// A duplicate PUBREL for an identifier that already completed means our
/// PUBCOMP was lost, so it is answered again without delivering anything.
#[must_use]
pub fn handle_incoming_pubrel(packet_id: u16, entry: EntryState, dup: bool) -> Vec<QoS2Action> {
    if entry.is_none() && dup {
        return vec![QoS2Action::SendPubComp { packet_id }];
    }
    if let Err(ignore) = check_entry(packet_id, entry, AwaitingAck::PubRel) {
        return vec![ignore];
    }
    vec![
        QoS2Action::SendPubComp { packet_id },
        QoS2Action::DeliverMessage { packet_id },
        QoS2Action::ReleaseIncoming { packet_id },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incoming_publish_new_and_duplicate() {
        assert_eq!(
            handle_incoming_publish_qos2(5, false),
            vec![
                QoS2Action::TrackIncoming { packet_id: 5 },
                QoS2Action::SendPubRec { packet_id: 5 },
            ]
        );
        assert_eq!(
            handle_incoming_publish_qos2(5, true),
            vec![
                QoS2Action::ReplaceIncoming { packet_id: 5 },
                QoS2Action::SendPubRec { packet_id: 5 },
            ]
        );
    }

    #[test]
    fn test_pubrec_moves_to_pubcomp() {
        let actions = handle_incoming_pubrec(1, Some((QoS::ExactlyOnce, AwaitingAck::PubRec)));
        assert_eq!(
            actions,
            vec![
                QoS2Action::SendPubRel { packet_id: 1 },
                QoS2Action::AwaitPubComp { packet_id: 1 },
            ]
        );
    }

    #[test]
    fn test_pubrec_for_qos1_entry_is_ignored() {
        let actions = handle_incoming_pubrec(1, Some((QoS::AtLeastOnce, AwaitingAck::PubAck)));
        assert_eq!(
            actions,
            vec![QoS2Action::Ignore {
                packet_id: 1,
                reason: IgnoreReason::QoSMismatch
            }]
        );
    }

    #[test]
    fn test_duplicate_pubrec_after_pubrel_is_ignored() {
        let actions = handle_incoming_pubrec(3, Some((QoS::ExactlyOnce, AwaitingAck::PubComp)));
        assert_eq!(
            actions,
            vec![QoS2Action::Ignore {
                packet_id: 3,
                reason: IgnoreReason::UnexpectedState
            }]
        );
    }

    #[test]
    fn test_pubcomp_completes() {
        assert_eq!(
            handle_incoming_pubcomp(9, Some((QoS::ExactlyOnce, AwaitingAck::PubComp))),
            vec![QoS2Action::CompleteFlow { packet_id: 9 }]
        );
        assert_eq!(
            handle_incoming_pubcomp(9, None),
            vec![QoS2Action::Ignore {
                packet_id: 9,
                reason: IgnoreReason::UnknownPacketId
            }]
        );
    }

    #[test]
    fn test_pubrel_delivers_once() {
        let actions = handle_incoming_pubrel(4, Some((QoS::ExactlyOnce, AwaitingAck::PubRel)), false);
        assert_eq!(
            actions,
            vec![
                QoS2Action::SendPubComp { packet_id: 4 },
                QoS2Action::DeliverMessage { packet_id: 4 },
                QoS2Action::ReleaseIncoming { packet_id: 4 },
            ]
        );
    }

    #[test]
    fn test_duplicate_pubrel_without_entry_answers_pubcomp_only() {
        assert_eq!(
            handle_incoming_pubrel(4, None, true),
            vec![QoS2Action::SendPubComp { packet_id: 4 }]
        );
        assert_eq!(
            handle_incoming_pubrel(4, None, false),
            vec![QoS2Action::Ignore {
                packet_id: 4,
                reason: IgnoreReason::UnknownPacketId
            }]
        );
    }
}
