//! ContactStage: the first handshake phase. Exactly one Contact Header is
//! sent and one received, in an order fixed by [`Role`](super::Role).

use async_trait::async_trait;
use tracing::debug;

use super::{next_message, send_message, Stage, State};
use crate::error::CoreError;
use crate::switch::MessageSwitch;
use crate::wire::{ContactHeader, Message};

#[derive(Debug, Default)]
pub struct ContactStage;

impl ContactStage {
    pub fn new() -> Self {
        ContactStage
    }
}

#[async_trait]
impl Stage for ContactStage {
    async fn start(&mut self, switch: &mut MessageSwitch, state: &mut State) -> Result<(), CoreError> {
        let local = ContactHeader::new(state.config.contact_flags);

        let peer_flags = tokio::select! {
            biased;
            _ = state.close_rx.changed() => return Err(CoreError::StageClose),
            result = run_exchange(switch, state, local) => result?,
        };

        debug!(can_tls = peer_flags.can_tls(), "contact header exchanged");
        state.contact_flags = Some(peer_flags);
        Ok(())
    }
}

async fn run_exchange(
    switch: &mut MessageSwitch,
    state: &State,
    local: ContactHeader,
) -> Result<crate::wire::ContactFlags, CoreError> {
    use super::Role;

    match state.config.role {
        Role::Active => {
            send_message(switch, Message::ContactHeader(local)).await?;
            receive_contact_header(switch).await
        }
        Role::Passive => {
            let peer = receive_contact_header(switch).await?;
            send_message(switch, Message::ContactHeader(local)).await?;
            Ok(peer)
        }
    }
}

async fn receive_contact_header(switch: &mut MessageSwitch) -> Result<crate::wire::ContactFlags, CoreError> {
    match next_message(switch).await? {
        Message::ContactHeader(header) => Ok(header.flags),
        other => Err(CoreError::Protocol(format!(
            "expected ContactHeader, got {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Configuration, Role};
    use crate::eid::EndpointId;
    use crate::wire::ContactFlags;
    use tokio::sync::watch;

    fn config(role: Role) -> Configuration {
        Configuration {
            role,
            contact_flags: ContactFlags::empty().with_can_tls(true),
            keepalive: 30,
            segment_mru: 4096,
            transfer_mru: 1 << 20,
            local_node_id: EndpointId::new("dtn://a/"),
        }
    }

    #[tokio::test]
    async fn active_and_passive_exchange_flags() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);
        let mut client_switch = MessageSwitch::new(client_r, client_w);
        let mut server_switch = MessageSwitch::new(server_r, server_w);

        let (_close_tx, close_rx) = watch::channel(false);
        let mut client_state = State::new(config(Role::Active), close_rx.clone());
        let mut server_state = State::new(config(Role::Passive), close_rx);

        let client_fut = ContactStage::new().start(&mut client_switch, &mut client_state);
        let server_fut = ContactStage::new().start(&mut server_switch, &mut server_state);
        let (client_result, server_result) = tokio::join!(client_fut, server_fut);

        client_result.unwrap();
        server_result.unwrap();
        assert!(client_state.contact_flags.unwrap().can_tls());
        assert!(server_state.contact_flags.unwrap().can_tls());
    }

    #[tokio::test]
    async fn unexpected_message_is_protocol_error() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);
        let mut client_switch = MessageSwitch::new(client_r, client_w);
        let mut server_switch = MessageSwitch::new(server_r, server_w);

        server_switch
            .outgoing
            .send(Message::Keepalive(crate::wire::Keepalive))
            .await
            .unwrap();

        let (_close_tx, close_rx) = watch::channel(false);
        let mut client_state = State::new(config(Role::Active), close_rx);
        let err = ContactStage::new()
            .start(&mut client_switch, &mut client_state)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }
}
