// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{Arc, Weak};

use tracing::{trace, warn};

use super::Task;
use crate::network::PacketListener;
use crate::protocol::{Packet, PacketType, Payload};
use crate::service::{BiddrConfig, ClientConnection};
use crate::utils::TaskQueue;

/// Turns the packets of one connected client into tasks.
///
/// Runs on the connection's receive loop, so it only decodes and queues; the
/// work itself happens on the worker pool. Holds the client weakly, the
/// registry owns it.
pub struct PacketHandler {
    client: Weak<ClientConnection>,
    queue: TaskQueue<Task>,
    config: Arc<BiddrConfig>,
}

impl PacketHandler {
    pub fn new(client: &Arc<ClientConnection>, queue: TaskQueue<Task>, config: Arc<BiddrConfig>) -> Self {
        PacketHandler {
            client: Arc::downgrade(client),
            queue,
            config,
        }
    }

    fn reject(client: &ClientConnection, packet: &Packet) {
        warn!(
            client_id = client.id(),
            "Unhandled packet type {} with payload {:?}",
            packet.packet_type(),
            packet.payload()
        );
        let _ = client.send_packet(Packet::was_ok(false));
    }
}

impl PacketListener for PacketHandler {
    fn packet_received(&self, packet: &Packet) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        trace!(client_id = client.id(), "Handling packet {}", packet.packet_type());

        let task = match (packet.packet_type(), packet.payload()) {
            (PacketType::Hello, _) => {
                let _ = client.send_packet(Packet::hello(self.config.random_greeting()));
                return;
            }
            (PacketType::Ping, _) => {
                self.queue
                    .schedule(Task::PingPong { client }, self.config.pong_delay());
                return;
            }
            // OK closes out the handshake, DISCONNECT is handled by the connection itself
            (PacketType::Ok | PacketType::Disconnect, _) => return,
            (PacketType::Login, Payload::Credentials(credentials)) => Task::Login {
                client: client.clone(),
                credentials: credentials.clone(),
            },
            (PacketType::Logout, _) => Task::Logout {
                client: client.clone(),
            },
            (PacketType::Register, Payload::Registration(registration)) => Task::Register {
                client: client.clone(),
                registration: registration.clone(),
            },
            (PacketType::CreateItem, Payload::NewItem(item)) => Task::CreateItem {
                client: client.clone(),
                item: item.clone(),
            },
            (PacketType::PlaceBid, Payload::Bid(bid)) => Task::PlaceBid {
                client: client.clone(),
                bid: bid.clone(),
            },
            (PacketType::Search, Payload::Search(options)) => Task::Search {
                client: client.clone(),
                options: options.clone(),
            },
            (PacketType::FetchItem, Payload::Id(item_id)) => Task::FetchItem {
                client: client.clone(),
                item_id: *item_id,
            },
            (PacketType::FetchUser, Payload::Id(user_id)) => Task::FetchUser {
                client: client.clone(),
                user_id: *user_id,
            },
            (PacketType::FetchUserBids, Payload::Id(user_id)) => Task::FetchUserBids {
                client: client.clone(),
                user_id: *user_id,
            },
            (PacketType::FetchSellerList, _) => Task::FetchSellerList {
                client: client.clone(),
            },
            (PacketType::FetchKeywords, _) => Task::FetchKeywords {
                client: client.clone(),
            },
            (PacketType::FetchReserveRange, _) => Task::FetchReserveRange {
                client: client.clone(),
            },
            _ => {
                Self::reject(&client, packet);
                return;
            }
        };

        let name = task.name();
        if let Err(e) = self.queue.submit(task) {
            warn!(client_id = client.id(), "Could not queue {}: {}", name, e);
            let _ = client.send_packet(Packet::was_ok(false));
        }
    }
}
