//! End-to-end races against real localhost sockets.

use anyhow::Result;
use tokio::net::TcpListener;

use dialrace::{
    CachePeer, ConnectionOpener, Destination, OpenError, PeerRef, PeerRegistry, RaceConfig,
    TcpConnector,
};

/// Binds and immediately releases a port, so connecting to it gets refused.
async fn refused_addr() -> Result<std::net::SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?)
}

#[tokio::test]
async fn races_to_the_live_listener() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let live = listener.local_addr()?;
    let dead = refused_addr().await?;

    let accept = tokio::spawn(async move { listener.accept().await });

    let (opener, feed) = ConnectionOpener::new(TcpConnector, RaceConfig::default());
    feed.add_all([Destination::origin(dead), Destination::origin(live)]);
    feed.finish();

    let opened = opener.run().await?;
    assert_eq!(opened.dest.addr(), live);
    assert_eq!(opened.conn.peer_addr()?, live);
    accept.await??;
    Ok(())
}

#[tokio::test]
async fn forwards_through_a_configured_peer() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let accept = tokio::spawn(async move { listener.accept().await });

    let mut registry = PeerRegistry::new();
    let peer = registry.add(CachePeer::parent("rack1", "127.0.0.1", addr.port()));

    let (opener, feed) = ConnectionOpener::new(TcpConnector, RaceConfig::default());
    feed.add(Destination::via_peer(peer, addr));
    feed.finish();

    let opened = opener.run().await?;
    assert_eq!(opened.dest.peer(), PeerRef::Peer(peer));
    assert_eq!(registry.get(peer).map(|p| p.name.as_str()), Some("rack1"));
    accept.await??;
    Ok(())
}

#[tokio::test]
async fn reports_exhaustion_when_nothing_listens() -> Result<()> {
    let dead = refused_addr().await?;

    let (opener, feed) = ConnectionOpener::new(TcpConnector, RaceConfig::default());
    feed.add(Destination::origin(dead));
    feed.finish();

    match opener.run().await {
        Err(OpenError::Exhausted { tried: 1, .. }) => Ok(()),
        other => anyhow::bail!("expected exhaustion, got {other:?}"),
    }
}
