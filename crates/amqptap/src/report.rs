//! Flat topology listing for `amqptap info`.

use std::fmt::Write;

use amqptap_core::topology::BrokerInfo;

pub fn render_topology(info: &BrokerInfo) -> String {
    let mut out = String::new();
    let overview = &info.overview;

    let _ = writeln!(
        out,
        "Broker {} (RabbitMQ {}, Erlang {})",
        overview
            .cluster_name
            .as_deref()
            .or(overview.node.as_deref())
            .unwrap_or("unknown"),
        overview.rabbitmq_version.as_deref().unwrap_or("?"),
        overview.erlang_version.as_deref().unwrap_or("?"),
    );

    if let Some(totals) = &overview.object_totals {
        let _ = writeln!(
            out,
            "{} connections, {} channels, {} exchanges, {} queues, {} consumers",
            totals.connections, totals.channels, totals.exchanges, totals.queues, totals.consumers
        );
    }

    let _ = writeln!(out, "\nExchanges:");
    for exchange in &info.exchanges {
        let mut flags = vec![exchange.kind.as_str()];
        if exchange.durable {
            flags.push("durable");
        }
        if exchange.auto_delete {
            flags.push("auto-delete");
        }
        if exchange.internal {
            flags.push("internal");
        }
        let _ = writeln!(
            out,
            "  {} {} ({})",
            exchange.vhost,
            exchange.display_name(),
            flags.join(", ")
        );
        for binding in info.bindings_from(&exchange.vhost, &exchange.name) {
            let _ = writeln!(
                out,
                "      -> {} {} [{}]",
                binding.destination_type, binding.destination, binding.routing_key
            );
        }
    }

    let _ = writeln!(out, "\nQueues:");
    for queue in &info.queues {
        let count = |n: Option<u64>| n.map_or_else(|| "?".to_string(), |n| n.to_string());
        let _ = writeln!(
            out,
            "  {} {} messages={} consumers={}{}",
            queue.vhost,
            queue.name,
            count(queue.messages),
            count(queue.consumers),
            if queue.exclusive { " exclusive" } else { "" },
        );
        for consumer in info.consumers_of(&queue.vhost, &queue.name) {
            let peer = consumer
                .channel_details
                .as_ref()
                .and_then(|c| c.connection_name.as_deref())
                .unwrap_or("unknown connection");
            let _ = writeln!(out, "      consumer {} on {}", consumer.consumer_tag, peer);
        }
    }

    out
}
