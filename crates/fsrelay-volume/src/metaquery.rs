//! Cached metadata queries: security descriptors, stream lists and EAs
//!
//! Each query answers from the node's cache item when one is live and
//! otherwise asks the remote, caching what comes back.

use crate::node::Node;
use crate::volume::Volume;
use bytes::Bytes;
use fsrelay_common::{MetaKind, OpKind, Result};
use fsrelay_proto::{RequestBuilder, Response};
use fsrelay_transact::SubmitTimeout;
use tracing::{debug, trace};

const fn query_kind(kind: MetaKind) -> OpKind {
    match kind {
        MetaKind::Security => OpKind::QuerySecurity,
        MetaKind::DirInfo => OpKind::QueryDirectory,
        MetaKind::StreamInfo => OpKind::QueryStreamInformation,
        MetaKind::Ea => OpKind::QueryEa,
    }
}

impl Volume {
    /// Security descriptor of `node`
    pub fn query_security(&self, node: &Node) -> Result<Bytes> {
        self.query_metadata(node, MetaKind::Security)
    }

    /// Named-stream listing of `node`
    pub fn query_stream_info(&self, node: &Node) -> Result<Bytes> {
        self.query_metadata(node, MetaKind::StreamInfo)
    }

    /// Extended attributes of `node`
    pub fn query_ea(&self, node: &Node) -> Result<Bytes> {
        self.query_metadata(node, MetaKind::Ea)
    }

    /// Replace the security descriptor of `node`
    pub fn set_security(&self, node: &Node, descriptor: Bytes) -> Result<()> {
        self.set_metadata(node, MetaKind::Security, OpKind::SetSecurity, descriptor)
    }

    /// Replace extended attributes of `node`
    pub fn set_ea(&self, node: &Node, eas: Bytes) -> Result<()> {
        self.set_metadata(node, MetaKind::Ea, OpKind::SetEa, eas)
    }

    fn query_metadata(&self, node: &Node, kind: MetaKind) -> Result<Bytes> {
        if let Some(item) = self.try_answer_from_cache(node, kind) {
            trace!("{kind} for {} answered from cache", node.path());
            return Ok(item.bytes());
        }

        let seen = node.change_number(kind);
        let request = RequestBuilder::new(query_kind(kind))
            .user_context(node.key().as_u64(), 0)
            .file_name(node.path())
            .build()?;
        let response = self
            .submit(request, SubmitTimeout::Default)
            .and_then(Response::into_result)?;
        let data = response.field_bytes(0)?;

        if let Some(cache) = self.cache(kind) {
            match node.populate(cache, kind, seen, data.clone()) {
                Ok(Some(_)) => {}
                Ok(None) => debug!("{kind} for {} changed while querying; not cached", node.path()),
                Err(e) => debug!("{kind} for {} not cached: {e}", node.path()),
            }
        }
        Ok(data)
    }

    fn set_metadata(&self, node: &Node, kind: MetaKind, op: OpKind, data: Bytes) -> Result<()> {
        let request = RequestBuilder::new(op)
            .user_context(node.key().as_u64(), 0)
            .file_name(node.path())
            .field(0, data)
            .build()?;
        // the remote may have applied part of the change even on failure
        let result = self.submit(request, SubmitTimeout::Default);
        self.invalidate(node, kind);
        result?
            .into_result()
            .map(|_| ())
            .inspect_err(|e| debug!("{op:?} on {} failed: {e}", node.path()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{Remote, reply_with};
    use fsrelay_common::{Config, Error, Status};
    use fsrelay_proto::ResponseBuilder;
    use std::sync::Arc;

    #[test]
    fn test_security_is_cached() {
        let volume = Arc::new(Volume::mount(Config::default()));
        let remote = Remote::spawn(&volume, |request| {
            assert_eq!(request.kind(), OpKind::QuerySecurity);
            assert_eq!(request.file_name().unwrap(), "/file");
            reply_with(request, b"O:BAG:BA")
        });

        let node = volume.open_node("/file");
        assert_eq!(&volume.query_security(&node).unwrap()[..], b"O:BAG:BA");
        assert_eq!(&volume.query_security(&node).unwrap()[..], b"O:BAG:BA");
        assert_eq!(remote.served(), 1);
        assert_eq!(remote.requests()[0].header().user_context, node.key().as_u64());

        volume.invalidate(&node, MetaKind::Security);
        volume.query_security(&node).unwrap();
        assert_eq!(remote.served(), 2);
        remote.shutdown(&volume);
    }

    #[test]
    fn test_kinds_are_cached_separately() {
        let volume = Arc::new(Volume::mount(Config::default()));
        let remote = Remote::spawn(&volume, |request| match request.kind() {
            OpKind::QueryStreamInformation => reply_with(request, b"::$DATA"),
            _ => reply_with(request, b"user.a=1"),
        });

        let node = volume.open_node("/file");
        assert_eq!(&volume.query_stream_info(&node).unwrap()[..], b"::$DATA");
        assert_eq!(&volume.query_ea(&node).unwrap()[..], b"user.a=1");
        assert_eq!(&volume.query_stream_info(&node).unwrap()[..], b"::$DATA");
        assert_eq!(remote.served(), 2);
        remote.shutdown(&volume);
    }

    #[test]
    fn test_set_invalidates() {
        let volume = Arc::new(Volume::mount(Config::default()));
        let remote = Remote::spawn(&volume, |request| match request.kind() {
            OpKind::QueryEa => reply_with(request, b"user.a=1"),
            _ => reply_with(request, b""),
        });

        let node = volume.open_node("/file");
        volume.query_ea(&node).unwrap();
        volume.set_ea(&node, Bytes::from_static(b"user.a=2")).unwrap();
        assert!(volume.try_answer_from_cache(&node, MetaKind::Ea).is_none());
        volume.query_ea(&node).unwrap();
        assert_eq!(remote.served(), 3);
        assert_eq!(remote.requests()[1].field(0).unwrap(), b"user.a=2");
        remote.shutdown(&volume);
    }

    #[test]
    fn test_remote_error_is_not_cached() {
        let volume = Arc::new(Volume::mount(Config::default()));
        let remote = Remote::spawn(&volume, |request| {
            ResponseBuilder::new(request.kind(), request.hint())
                .status(Status::ACCESS_DENIED)
                .build()
                .unwrap()
        });

        let node = volume.open_node("/secret");
        for _ in 0..2 {
            assert_eq!(
                volume.query_stream_info(&node).unwrap_err(),
                Error::Remote(Status::ACCESS_DENIED)
            );
        }
        assert_eq!(remote.served(), 2);
        remote.shutdown(&volume);
    }

    #[test]
    fn test_oversized_item_is_served_uncached() {
        let mut config = Config::default();
        config.meta.item_size_max = 4;
        let volume = Arc::new(Volume::mount(config));
        let remote = Remote::spawn(&volume, |request| reply_with(request, b"too large"));

        let node = volume.open_node("/file");
        assert_eq!(&volume.query_security(&node).unwrap()[..], b"too large");
        volume.query_security(&node).unwrap();
        assert_eq!(remote.served(), 2);
        remote.shutdown(&volume);
    }
}
