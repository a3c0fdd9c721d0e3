//! Test harness: a device wired to loopback firmware and a soft clock.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayVec;
use magma_core::{ContextId, EngineClass, GpuAddr, Priority, Result};
use magma_hal::{SoftIrq, SoftPlatform};
use magma_rpc::LoopbackFirmware;

use crate::config::SubmissionConfig;
use crate::context::{Context, ContextDesc, ContextKind};
use crate::device::Device;
use crate::request::Request;

pub(crate) struct Harness {
    pub dev: Device,
    pub fw: Arc<LoopbackFirmware>,
    pub platform: Arc<SoftPlatform>,
    tail: AtomicU32,
    lrca: AtomicU32,
}

impl Harness {
    /// All slots usable by single contexts
    pub fn single_pool(num_slots: u32) -> Self {
        Self::with_config(SubmissionConfig {
            num_slots,
            multi_reserved: 0,
            ..SubmissionConfig::default()
        })
    }

    pub fn with_config(config: SubmissionConfig) -> Self {
        match Self::try_with_config(config) {
            Ok(h) => h,
            Err(err) => panic!("attach failed: {}", err),
        }
    }

    pub fn try_with_config(config: SubmissionConfig) -> Result<Self> {
        let fw = Arc::new(LoopbackFirmware::new());
        let platform = Arc::new(SoftPlatform::new());
        let dev = Device::attach(
            config,
            fw.clone(),
            platform.clone(),
            Box::new(SoftIrq::new()),
        )?;
        Ok(Self {
            dev,
            fw,
            platform,
            tail: AtomicU32::new(0),
            lrca: AtomicU32::new(1),
        })
    }

    fn next_lrca(&self) -> GpuAddr {
        GpuAddr::new(u64::from(self.lrca.fetch_add(1, Ordering::Relaxed)) << 12)
    }

    /// Parent render context with `children` children
    pub fn parent_desc(children: usize) -> ContextDesc {
        let mut list = ArrayVec::new();
        for i in 0..children {
            list.push(GpuAddr::new(0x10_0000 + ((i as u64) << 12)));
        }
        ContextDesc {
            kind: ContextKind::Parent {
                instance: 0,
                children: list,
            },
            class: EngineClass::Render,
            lrca: GpuAddr::new(0x8_0000),
        }
    }

    /// Create a physical render context
    pub fn context(&self) -> ContextId {
        self.dev
            .create_context(ContextDesc::physical(EngineClass::Render, 0, self.next_lrca()))
            .unwrap()
    }

    pub fn ctx(&self, id: ContextId) -> Arc<Context> {
        self.dev.context(id).unwrap()
    }

    /// Create a request without submitting it
    pub fn create(&self, id: ContextId) -> Arc<Request> {
        self.create_prio(id, Priority::NORMAL)
    }

    fn create_prio(&self, id: ContextId, prio: Priority) -> Arc<Request> {
        let tail = self.tail.fetch_add(64, Ordering::Relaxed) + 64;
        self.dev.create_request(id, prio, tail).unwrap()
    }

    pub fn submit(&self, id: ContextId) -> Arc<Request> {
        self.submit_prio(id, Priority::NORMAL)
    }

    pub fn submit_prio(&self, id: ContextId, prio: Priority) -> Arc<Request> {
        let req = self.create_prio(id, prio);
        self.dev.submit_request(&req).unwrap();
        req
    }

    /// Complete `req` and everything before it on its timeline
    pub fn complete(&self, req: &Request) {
        req.timeline().signal(req.seqno());
    }
}
