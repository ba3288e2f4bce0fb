//! Packet receive pipeline.
//!
//! ```text
//! receive ─► classify ─► learn source ─┐
//!                                      ▼
//!        ┌──────────── Input(node, interface) ◄──────────┐
//!        │  tenant in-chain (first pass)                 │ redirect (in)
//!        │  interface in-chain                           │
//!        │  terminal: drop / bridge: node in-chain       │
//!        │  known unicast ─► egress                      │
//!        │  otherwise     ─► flood (one replica per egress)
//!        │                                               │
//!        └──────────── Output(interface) ◄───────────────┘ redirect (out)
//!                         interface out-chain, route, transmit
//! ```
//!
//! Filter signals travel back through `?`. The hop loop turns a redirect
//! into the next hop and a drop into the packet outcome. Route failures
//! are recorded as faulted paths once every node lock is released.

use std::borrow::Cow;
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};
use vtn_types::{NodeId, PhysicalPort};

use super::VtnManager;
use crate::classifier::PacketClassifier;
use crate::event::VtnEvent;
use crate::filter::{Direction, DropReason, PacketSignal, Redirection};
use crate::mapping::{MacVlan, PortVlan};
use crate::packet::{EtherFrame, PacketContext};
use crate::path::{InterfacePath, NodePath};
use crate::topology::{FlowSpec, Route};
use crate::vnode::VNode;

/// What happened to a received packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketOutcome {
    /// The packet was sent out of `transmitted` ports.
    Forwarded { transmitted: usize },
    Dropped(DropReason),
    /// No virtual node maps the packet.
    Ignored,
}

type Flow<T> = std::result::Result<T, PacketSignal>;

/// Next place the packet enters.
#[derive(Debug, Clone)]
enum Hop {
    Input {
        node: NodePath,
        interface: Option<String>,
    },
    Output(InterfacePath),
}

/// One transmission target.
#[derive(Debug, Clone)]
struct Egress {
    port_vlan: PortVlan,
    interface: Option<String>,
}

/// Switch pairs without a route, per node.
type Faults = Vec<(NodePath, NodeId, NodeId)>;

impl VtnManager {
    /// Processes a frame received on a physical port.
    #[instrument(level = "debug", skip(self, frame), fields(src = %frame.src, dst = %frame.dst, vlan = %frame.vlan))]
    pub fn receive(&self, port: &PhysicalPort, frame: EtherFrame) -> PacketOutcome {
        let mut events = Vec::new();
        let outcome = self.process(port, frame, &mut events);
        self.dispatch(events);
        outcome
    }

    fn process(&self, port: &PhysicalPort, frame: EtherFrame, events: &mut Vec<VtnEvent>) -> PacketOutcome {
        let classifier = PacketClassifier::new(&self.registry, self.topology.as_ref());
        let Some(mapped) = classifier.classify(port, frame.src, frame.vlan) else {
            debug!("{}: packet from {} is not mapped", port, frame.src);
            return PacketOutcome::Ignored;
        };

        if let Some(activation) = &mapped.activation {
            if activation.changed {
                events.push(VtnEvent::MacHostActivated {
                    path: mapped.path.clone(),
                    host: MacVlan::new(frame.src, frame.vlan),
                    port: port.clone(),
                });
            }
            if activation.first {
                self.refresh_node(&mapped.path, events);
            }
        }

        let ingress = PortVlan::new(port.clone(), frame.vlan);
        let mut ctx = PacketContext::new(frame, ingress);
        if let Ok(node) = self.node(&mapped.path) {
            let node = node.read();
            if node.is_bridge() {
                node.mac_table()
                    .learn(ctx.frame.src, &ctx.ingress, mapped.interface.as_deref());
            }
        }

        let mut faults = Faults::new();
        let mut hop = Hop::Input {
            node: mapped.path,
            interface: mapped.interface,
        };
        let result = loop {
            let step = match &hop {
                Hop::Input { node, interface } => self.input(&mut ctx, node, interface.as_deref(), &mut faults),
                Hop::Output(destination) => self.output(&mut ctx, destination, &mut faults),
            };
            match step {
                Ok(transmitted) => break Ok(transmitted),
                Err(PacketSignal::Drop(reason)) => break Err(reason),
                Err(PacketSignal::Redirect(redirection)) => match self.redirect(&mut ctx, redirection) {
                    Ok(next) => hop = next,
                    Err(reason) => break Err(reason),
                },
            }
        };
        self.record_faults(faults, events);

        match result {
            Ok(transmitted) => PacketOutcome::Forwarded { transmitted },
            Err(reason) => {
                debug!("packet from {} dropped: {}", ctx.frame.src, reason);
                PacketOutcome::Dropped(reason)
            }
        }
    }

    /// Resolves the destination of a redirection and counts the hop.
    fn redirect(&self, ctx: &mut PacketContext, redirection: Redirection) -> Result<Hop, DropReason> {
        let Redirection {
            destination,
            output,
            filter,
        } = redirection;
        let node = self
            .node(&destination.node_path())
            .map_err(|_| DropReason::DestinationNotFound {
                destination: destination.clone(),
            })?;
        {
            let node = node.read();
            let iface = node
                .interface(&destination.interface)
                .ok_or_else(|| DropReason::DestinationNotFound {
                    destination: destination.clone(),
                })?;
            if !iface.is_enabled() {
                return Err(DropReason::DestinationDisabled { destination });
            }
        }

        ctx.redirect_hops += 1;
        if ctx.redirect_hops > self.max_redirections {
            warn!(
                "{}: packet from {} dropped after {} redirections",
                filter, ctx.frame.src, self.max_redirections
            );
            return Err(DropReason::RedirectLoop {
                hops: ctx.redirect_hops,
            });
        }
        debug!("{}: redirected to {} (hop {})", filter, destination, ctx.redirect_hops);

        Ok(if output {
            Hop::Output(destination)
        } else {
            Hop::Input {
                node: destination.node_path(),
                interface: Some(destination.interface),
            }
        })
    }

    /// Packet arriving at a node, through `interface` if it is port mapped
    /// or redirected.
    fn input(
        &self,
        ctx: &mut PacketContext,
        path: &NodePath,
        interface: Option<&str>,
        faults: &mut Faults,
    ) -> Flow<usize> {
        if ctx.is_first_pass() {
            let tenant = self.tenant(&path.tenant).map_err(|_| DropReason::NodeNotFound)?;
            tenant
                .in_filters()
                .read()
                .evaluate(ctx, None, self.conditions.as_ref())?;
        }

        let node = self.node(path).map_err(|_| DropReason::NodeNotFound)?;
        let node = node.read();
        if let Some(name) = interface {
            let iface = node.interface(name).ok_or(DropReason::NodeNotFound)?;
            if !iface.is_enabled() {
                return Err(DropReason::InterfaceDisabled {
                    interface: iface.path().clone(),
                }
                .into());
            }
            iface
                .filters(Direction::In)
                .evaluate(ctx, None, self.conditions.as_ref())?;
        }

        if !node.is_bridge() {
            return Err(DropReason::TerminalSink.into());
        }
        node.filters(Direction::In)
            .evaluate(ctx, None, self.conditions.as_ref())?;
        self.forward(&node, ctx, faults)
    }

    /// Packet sent out of an interface by an output redirection.
    fn output(&self, ctx: &mut PacketContext, destination: &InterfacePath, faults: &mut Faults) -> Flow<usize> {
        let node = self
            .node(&destination.node_path())
            .map_err(|_| DropReason::DestinationNotFound {
                destination: destination.clone(),
            })?;
        let node = node.read();
        let iface = node
            .interface(&destination.interface)
            .ok_or_else(|| DropReason::DestinationNotFound {
                destination: destination.clone(),
            })?;

        let egress_vlan = iface.mapped().map(|pv| pv.vlan);
        iface
            .filters(Direction::Out)
            .evaluate(ctx, egress_vlan, self.conditions.as_ref())?;
        let egress = iface.mapped().cloned().ok_or_else(|| DropReason::Unmapped {
            interface: destination.clone(),
        })?;

        let route = self
            .route(node.path(), &ctx.ingress.port.node, &egress.port.node, faults)
            .ok_or(DropReason::NoRoute)?;
        self.emit(node.path(), ctx, &egress, route, ctx.is_unicast());
        Ok(1)
    }

    /// Bridge forwarding: a known unicast destination gets one egress,
    /// anything else is flooded.
    fn forward(&self, node: &VNode, ctx: &mut PacketContext, faults: &mut Faults) -> Flow<usize> {
        if ctx.is_unicast() {
            let dst = ctx.frame.dst;
            if let Some(entry) = node.mac_table().lookup(dst) {
                let classifier = PacketClassifier::new(&self.registry, self.topology.as_ref());
                let valid = classifier
                    .lookup(&entry.port_vlan, dst)
                    .is_some_and(|mapped| mapped.path == *node.path() && mapped.interface == entry.interface);
                if !valid {
                    debug!("{}: stale entry for {} on {} removed", node.path(), dst, entry.port_vlan);
                    node.mac_table().remove(dst);
                } else if entry.port_vlan == ctx.ingress {
                    debug!("{}: {} is on the ingress port", node.path(), dst);
                    return Ok(0);
                } else {
                    let egress = Egress {
                        port_vlan: entry.port_vlan,
                        interface: entry.interface,
                    };
                    return self.unicast(node, ctx, &egress, faults);
                }
            }
        }
        Ok(self.flood(node, ctx, faults))
    }

    fn unicast(&self, node: &VNode, ctx: &mut PacketContext, egress: &Egress, faults: &mut Faults) -> Flow<usize> {
        let vlan = Some(egress.port_vlan.vlan);
        node.filters(Direction::Out)
            .evaluate(ctx, vlan, self.conditions.as_ref())?;
        if let Some(iface) = egress.interface.as_deref().and_then(|name| node.interface(name)) {
            if !iface.is_enabled() {
                return Err(DropReason::InterfaceDisabled {
                    interface: iface.path().clone(),
                }
                .into());
            }
            iface
                .filters(Direction::Out)
                .evaluate(ctx, vlan, self.conditions.as_ref())?;
        }

        let route = self
            .route(node.path(), &ctx.ingress.port.node, &egress.port_vlan.port.node, faults)
            .ok_or(DropReason::NoRoute)?;
        self.emit(node.path(), ctx, &egress.port_vlan, route, true);
        Ok(1)
    }

    /// Sends one replica to every egress of the bridge. A signal raised for
    /// one egress only stops that replica.
    fn flood(&self, node: &VNode, ctx: &PacketContext, faults: &mut Faults) -> usize {
        let mut transmitted = 0;
        for egress in self.flood_targets(node, &ctx.ingress) {
            match self.flood_one(node, ctx, &egress, faults) {
                Ok(true) => transmitted += 1,
                Ok(false) => {}
                Err(signal) => debug!("{}: replica for {} stopped: {}", node.path(), egress.port_vlan, signal),
            }
        }
        transmitted
    }

    fn flood_one(&self, node: &VNode, ctx: &PacketContext, egress: &Egress, faults: &mut Faults) -> Flow<bool> {
        let vlan = Some(egress.port_vlan.vlan);
        let conditions = self.conditions.as_ref();
        let replica = node.filters(Direction::Out).evaluate_replica(ctx, vlan, conditions)?;
        let replica = match egress.interface.as_deref().and_then(|name| node.interface(name)) {
            Some(iface) => Cow::Owned(
                iface
                    .filters(Direction::Out)
                    .evaluate_replica(&replica, vlan, conditions)?
                    .into_owned(),
            ),
            None => replica,
        };

        let Some(route) = self.route(node.path(), &ctx.ingress.port.node, &egress.port_vlan.port.node, faults) else {
            return Ok(false);
        };
        self.emit(node.path(), &replica, &egress.port_vlan, route, false);
        Ok(true)
    }

    /// Every mapped port and VLAN of the bridge except the ingress.
    fn flood_targets(&self, node: &VNode, ingress: &PortVlan) -> Vec<Egress> {
        let mut targets: BTreeMap<PortVlan, Option<String>> = BTreeMap::new();
        for iface in node.interfaces().filter(|iface| iface.is_enabled()) {
            if let Some(port_vlan) = iface.mapped() {
                if self.topology.is_port_up(&port_vlan.port) {
                    targets.insert(port_vlan.clone(), Some(iface.name().to_string()));
                }
            }
        }

        if let Some(mapping) = self.registry.mac_map(node.path()) {
            for port_vlan in mapping.activation().mapped_ports() {
                if !self.registry.is_port_mapped(&port_vlan) {
                    targets.entry(port_vlan).or_insert(None);
                }
            }
        }

        for vmap in node.vlan_maps().filter(|vmap| vmap.is_registered()) {
            let key = vmap.key();
            for port in self.topology.edge_ports(key.node.as_ref()) {
                let port_vlan = PortVlan::new(port, key.vlan);
                if self.registry.is_port_mapped(&port_vlan) {
                    continue;
                }
                let owned = self
                    .registry
                    .find_vlan_map(&port_vlan.port.node, key.vlan)
                    .is_some_and(|owner| owner.bridge == *node.path());
                if owned {
                    targets.entry(port_vlan).or_insert(None);
                }
            }
        }

        targets.remove(ingress);
        targets
            .into_iter()
            .map(|(port_vlan, interface)| Egress { port_vlan, interface })
            .collect()
    }

    /// Route between two switches under the selected path policy. A
    /// missing route is recorded as a fault of `owner`.
    fn route(&self, owner: &NodePath, source: &NodeId, destination: &NodeId, faults: &mut Faults) -> Option<Route> {
        if source == destination {
            return Some(Route::local(source.clone()));
        }
        let policy = self.policies.resolve(self.selected_path_policy());
        let route = self.routes.resolve(source, destination, &policy);
        if route.is_none() {
            warn!("{}: no route from {} to {}", owner, source, destination);
            faults.push((owner.clone(), source.clone(), destination.clone()));
        }
        route
    }

    fn emit(&self, owner: &NodePath, ctx: &PacketContext, egress: &PortVlan, route: Route, install: bool) {
        let mut frame = ctx.frame.clone();
        frame.vlan = egress.vlan;
        if install {
            self.sink.install_flow(&FlowSpec {
                owner: owner.clone(),
                ingress: ctx.ingress.clone(),
                egress: egress.clone(),
                src: frame.src,
                dst: frame.dst,
                route,
            });
        }
        debug!("{}: transmit to {}", owner, egress);
        self.sink.transmit(&egress.port, &frame);
    }

    /// Adds faulted paths found while forwarding and recomputes the state
    /// of the nodes that own them.
    fn record_faults(&self, faults: Faults, events: &mut Vec<VtnEvent>) {
        let mut by_node: BTreeMap<NodePath, Vec<(NodeId, NodeId)>> = BTreeMap::new();
        for (owner, source, destination) in faults {
            by_node.entry(owner).or_default().push((source, destination));
        }
        for (owner, paths) in by_node {
            let Ok(node) = self.node(&owner) else { continue };
            let mut node = node.write();
            for (source, destination) in paths {
                if node.faults_mut().add(source.clone(), destination.clone()) {
                    events.push(VtnEvent::FaultPathAdded {
                        path: owner.clone(),
                        source,
                        destination,
                    });
                }
            }
            node.refresh(self.env(), events);
        }
    }
}
