//! Host import surface exposed to guest modules
//!
//! Every import lives under the `env` module. Pointer/length pairs index
//! into the guest's exported linear memory; imports that hand a buffer back
//! allocate it from the page pool and return a packed i64 (pointer in the
//! high 32 bits, length in the low 32). A negative return signals failure.

use wasmtime::{AsContextMut, Caller, Extern, Linker, Memory, TypedFunc};

use super::alloc::{AllocError, PageSource};
use super::{HostState, ABI_VERSION};
use crate::error::Error;

/// Install the full import surface on a linker.
pub(crate) fn register(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "init_module",
        |mut caller: Caller<'_, HostState>, version: i32| -> anyhow::Result<()> {
            if version != ABI_VERSION {
                anyhow::bail!(
                    "guest speaks ABI version {}, host speaks {}",
                    version,
                    ABI_VERSION
                );
            }
            caller.data_mut().abi_version = Some(version);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "get_env",
        |mut caller: Caller<'_, HostState>, key_ptr: i32, key_len: i32| -> anyhow::Result<i64> {
            let key = read_guest_string(&mut caller, key_ptr, key_len)?;
            match caller.data().env.get(&key).cloned() {
                None => Ok(0),
                Some(value) => return_bytes(&mut caller, value.as_bytes()),
            }
        },
    )?;

    linker.func_wrap("env", "get_time", |_caller: Caller<'_, HostState>| -> i64 {
        chrono::Utc::now().timestamp()
    })?;

    linker.func_wrap(
        "env",
        "write_log",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let message = read_guest_string(&mut caller, ptr, len)?;
            tracing::info!(
                target: "guest",
                instance_id = %caller.data().instance_id,
                "{}",
                message
            );
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "create_uuid",
        |mut caller: Caller<'_, HostState>| -> anyhow::Result<i64> {
            let id = uuid::Uuid::new_v4().to_string();
            return_bytes(&mut caller, id.as_bytes())
        },
    )?;

    linker.func_wrap(
        "env",
        "register_handler",
        |mut caller: Caller<'_, HostState>,
         uri_ptr: i32,
         uri_len: i32,
         handler_id: i32|
         -> anyhow::Result<()> {
            let uri = read_guest_string(&mut caller, uri_ptr, uri_len)?;
            tracing::debug!(
                instance_id = %caller.data().instance_id,
                "guest registered request handler {} for {}",
                handler_id,
                uri
            );
            caller.data_mut().routes.insert(uri, handler_id);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "write_response",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            caller.data_mut().response = Some(bytes);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "register_event_handler",
        |mut caller: Caller<'_, HostState>,
         type_ptr: i32,
         type_len: i32,
         handler_id: i32|
         -> anyhow::Result<()> {
            let event_type = read_guest_string(&mut caller, type_ptr, type_len)?;
            tracing::debug!(
                instance_id = %caller.data().instance_id,
                "guest registered event handler {} for {}",
                handler_id,
                event_type
            );
            caller
                .data_mut()
                .event_handlers
                .push((event_type, handler_id));
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "report_event_error",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let message = read_guest_string(&mut caller, ptr, len)?;
            caller.data_mut().event_error = Some(message);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "sqlite_host_handler",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i64> {
            let request = read_guest(&mut caller, ptr, len)?;
            let db = caller.data().db.clone();
            let rt = caller.data().rt.clone();
            // The guest worker runs on its own OS thread, outside the
            // reactor, so blocking on the handle here is safe.
            let response = rt.block_on(async move { db.handle_bytes(&request).await });
            return_bytes(&mut caller, &response)
        },
    )?;

    linker.func_wrap(
        "env",
        "cross_service_request",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i64> {
            let request = read_guest(&mut caller, ptr, len)?;
            let cross = caller.data().cross.clone();
            let rt = caller.data().rt.clone();
            let response = rt.block_on(async move { cross.call_raw(&request).await });
            return_bytes(&mut caller, &response)
        },
    )?;

    Ok(())
}

/// Pack a guest buffer location into the ABI's i64 return form.
pub(crate) fn pack_buffer(ptr: u32, len: u32) -> Result<i64, Error> {
    if ptr > i32::MAX as u32 || len > i32::MAX as u32 {
        return Err(Error::Guest("guest buffer outside packable range".into()));
    }
    Ok(((ptr as i64) << 32) | (len as i64))
}

/// Unpack an i64 produced by [`pack_buffer`].
pub(crate) fn unpack_buffer(packed: i64) -> (u32, u32) {
    (((packed >> 32) & 0x7fff_ffff) as u32, (packed & 0xffff_ffff) as u32)
}

struct GuestPages<'a, C: AsContextMut<Data = HostState>> {
    ctx: &'a mut C,
    alloc_page: TypedFunc<(), i32>,
}

impl<C: AsContextMut<Data = HostState>> PageSource for GuestPages<'_, C> {
    fn acquire_page(&mut self) -> Result<u32, AllocError> {
        match self.alloc_page.call(&mut *self.ctx, ()) {
            Ok(base) => Ok(base as u32),
            Err(e) => {
                tracing::error!("guest alloc_page trapped: {}", e);
                Err(AllocError::OutOfMemory)
            }
        }
    }
}

/// Copy `bytes` into a pool-owned block of guest memory.
pub(crate) fn copy_into_guest(
    ctx: &mut impl AsContextMut<Data = HostState>,
    memory: Memory,
    alloc_page: TypedFunc<(), i32>,
    bytes: &[u8],
) -> Result<(u32, u32), Error> {
    let mut pool = std::mem::take(&mut ctx.as_context_mut().data_mut().alloc);
    let allocated = {
        let mut pages = GuestPages {
            ctx: &mut *ctx,
            alloc_page,
        };
        pool.alloc(bytes.len() as u32, &mut pages)
    };
    ctx.as_context_mut().data_mut().alloc = pool;

    let ptr = allocated.map_err(|e| Error::Guest(format!("guest allocation failed: {}", e)))?;
    let start = ptr as usize;
    let end = start + bytes.len();
    let data = memory.data_mut(&mut *ctx);
    if end > data.len() {
        return Err(Error::Guest(
            "allocated block lies outside guest memory".into(),
        ));
    }
    data[start..end].copy_from_slice(bytes);
    Ok((ptr, bytes.len() as u32))
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> anyhow::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow::anyhow!("guest does not export memory"))
}

fn guest_alloc_page(caller: &mut Caller<'_, HostState>) -> anyhow::Result<TypedFunc<(), i32>> {
    let func = caller
        .get_export("alloc_page")
        .and_then(Extern::into_func)
        .ok_or_else(|| anyhow::anyhow!("guest does not export alloc_page"))?;
    Ok(func.typed::<(), i32>(&*caller)?)
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let start = ptr as u32 as usize;
    let len = len as u32 as usize;
    memory
        .data(&*caller)
        .get(start..start + len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| anyhow::anyhow!("guest pointer out of range"))
}

fn read_guest_string(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<String> {
    let bytes = read_guest(caller, ptr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Copy `bytes` into guest memory and pack the location; allocator failure
/// surfaces as the ABI's negative-size error, not a trap.
fn return_bytes(caller: &mut Caller<'_, HostState>, bytes: &[u8]) -> anyhow::Result<i64> {
    let memory = guest_memory(caller)?;
    let alloc_page = guest_alloc_page(caller)?;
    match copy_into_guest(caller, memory, alloc_page, bytes) {
        Ok((ptr, len)) => match pack_buffer(ptr, len) {
            Ok(packed) => Ok(packed),
            Err(_) => Ok(-1),
        },
        Err(e) => {
            tracing::warn!("failed to return buffer to guest: {}", e);
            Ok(-1)
        }
    }
}
