//! OpenCL search device. Compiled behind the `gpu` feature; the kernel
//! source comes from the algorithm registry.

use ocl::{Buffer, MemFlags, ProQue};
use tracing::info;

use crate::algo::Algorithm;
use crate::error::MinerError;

use super::device::{ResultSlot, SearchDevice, RESULT_SLOTS, SLOTS_READ};

pub struct OclDevice {
    workgroups: u32,
    state: Option<DeviceState>,
}

struct DeviceState {
    pro_que: ProQue,
    midstate: Buffer<u32>,
    target: Buffer<u32>,
    results: Buffer<u32>,
    dispatch_size: u32,
}

impl OclDevice {
    pub fn new(workgroups: u32) -> Self {
        OclDevice { workgroups: workgroups.max(1), state: None }
    }
}

impl SearchDevice for OclDevice {
    fn configure(
        &mut self,
        algo: Algorithm,
        midstate_words: &[u32],
        target_words: &[u32],
    ) -> Result<(), MinerError> {
        if !algo.is_minable() {
            return Err(MinerError::UnsupportedAlgorithm(algo.name().to_string()));
        }
        let desc = algo.descriptor();
        let dispatch_size = self.workgroups * desc.workgroup_size;

        let pro_que = ProQue::builder()
            .src(desc.kernel_source)
            .dims(dispatch_size as usize)
            .build()
            .map_err(|e| MinerError::DeviceUnavailable(format!("OpenCL build: {}", e)))?;
        info!(
            device = %pro_que.device().name().unwrap_or_else(|_| "unknown".into()),
            algo = desc.name,
            dispatch_size,
            "device pipeline built"
        );

        let midstate = pro_que
            .buffer_builder::<u32>()
            .len(midstate_words.len())
            .flags(MemFlags::READ_ONLY | MemFlags::COPY_HOST_PTR)
            .copy_host_slice(midstate_words)
            .build()
            .map_err(ocl_err)?;
        let target = pro_que
            .buffer_builder::<u32>()
            .len(target_words.len())
            .flags(MemFlags::READ_ONLY | MemFlags::COPY_HOST_PTR)
            .copy_host_slice(target_words)
            .build()
            .map_err(ocl_err)?;
        let results = pro_que
            .buffer_builder::<u32>()
            .len(1 + RESULT_SLOTS * desc.result_arity)
            .flags(MemFlags::READ_WRITE)
            .build()
            .map_err(ocl_err)?;

        self.state = Some(DeviceState { pro_que, midstate, target, results, dispatch_size });
        Ok(())
    }

    fn dispatch_size(&self) -> u32 {
        self.state.as_ref().map(|s| s.dispatch_size).unwrap_or(0)
    }

    fn dispatch(&mut self, nonce_hi: u32, nonce_offset: u32) -> Result<Vec<ResultSlot>, MinerError> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| MinerError::DeviceUnavailable("device not configured".into()))?;

        // Counter word back to zero; slots are overwritten on append.
        state.results.write(&[0u32][..]).len(1).enq().map_err(ocl_err)?;

        let kernel = state
            .pro_que
            .kernel_builder("search")
            .arg(&state.midstate)
            .arg(&state.target)
            .arg(&state.results)
            .arg(nonce_offset)
            .arg(nonce_hi)
            .build()
            .map_err(ocl_err)?;
        unsafe {
            kernel.enq().map_err(ocl_err)?;
        }

        let mut readback = vec![0u32; 1 + SLOTS_READ * 4];
        state
            .results
            .read(&mut readback)
            .len(readback.len())
            .enq()
            .map_err(ocl_err)?;

        let found = (readback[0] as usize).min(SLOTS_READ);
        let mut slots = Vec::with_capacity(found);
        for i in 0..found {
            let base = 1 + i * 4;
            if readback[base + 3] != 1 {
                continue;
            }
            slots.push(ResultSlot {
                nonce_lo: readback[base],
                hash_w0: readback[base + 1],
                hash_w1: readback[base + 2],
                flag: readback[base + 3],
            });
        }
        Ok(slots)
    }
}

fn ocl_err(e: ocl::Error) -> MinerError {
    MinerError::DeviceUnavailable(e.to_string())
}
