//! Virtual memory: swap area, physical frames, fault handling, address
//! spaces.

pub mod addrspace;
pub mod pagefault;
pub mod physmem;
pub mod swap;

pub use addrspace::AddrSpace;
pub use pagefault::PageFaultManager;
pub use physmem::PhysicalMemManager;
pub use swap::SwapManager;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rvos_machine::ExceptionType;

    use crate::error::ErrorKind;
    use crate::testing;
    use crate::vm::addrspace::AddrSpace;
    use crate::Kernel;

    fn anon_space(kernel: &Arc<Kernel>) -> Arc<AddrSpace> {
        AddrSpace::new(
            kernel.cfg.clone(),
            kernel.machine.mmu.clone(),
            kernel.physmem.clone(),
            kernel.swap.clone(),
            &kernel.scheduler,
            None,
        )
        .unwrap()
    }

    /// Map `n` anonymous read/write pages, returning the first page.
    fn map_anon(space: &Arc<AddrSpace>, n: usize) -> usize {
        let base = space.alloc(n).unwrap();
        for vp in base..base + n {
            space.translation.update(vp, |e| {
                e.read_allowed = true;
                e.write_allowed = true;
            });
        }
        base
    }

    /// Write one byte of user memory, resolving page faults like the trap
    /// path would.
    fn poke(kernel: &Arc<Kernel>, space: &Arc<AddrSpace>, addr: u64, value: u8) {
        loop {
            match kernel.machine.mmu.write_mem(addr, 1, value as u64) {
                Ok(()) => return,
                Err(fault) if fault.exception == ExceptionType::PageFault => {
                    let vp = (fault.vaddr / kernel.cfg.page_size as u64) as usize;
                    kernel.pagefault.resolve(space, vp).unwrap();
                }
                Err(fault) => panic!("unexpected fault {fault:?}"),
            }
        }
    }

    fn peek(kernel: &Arc<Kernel>, space: &Arc<AddrSpace>, addr: u64) -> u8 {
        loop {
            match kernel.machine.mmu.read_mem(addr, 1) {
                Ok(value) => return value as u8,
                Err(fault) if fault.exception == ExceptionType::PageFault => {
                    let vp = (fault.vaddr / kernel.cfg.page_size as u64) as usize;
                    kernel.pagefault.resolve(space, vp).unwrap();
                }
                Err(fault) => panic!("unexpected fault {fault:?}"),
            }
        }
    }

    #[test]
    fn eight_pages_survive_four_frames() {
        let mut cfg = testing::test_config();
        cfg.num_phys_pages = 4;
        let kernel = testing::boot_with(cfg, "vm-swap");
        let space = anon_space(&kernel);
        kernel
            .machine
            .mmu
            .set_translation(Some(space.translation.clone()));

        let page_size = kernel.cfg.page_size as u64;
        let base = map_anon(&space, 8);
        for i in 0..8u64 {
            let addr = (base as u64 + i) * page_size + 3;
            poke(&kernel, &space, addr, 0x40 + i as u8);
        }
        // Only four pages can be resident; the rest went through the swap
        // disk and must come back intact.
        for i in 0..8u64 {
            let addr = (base as u64 + i) * page_size + 3;
            assert_eq!(peek(&kernel, &space, addr), 0x40 + i as u8);
        }
        assert!(kernel.machine.stats.page_faults() >= 12);
        kernel.physmem.audit();
        kernel.machine.mmu.set_translation(None);
    }

    #[test]
    fn address_space_teardown_releases_frames_and_swap() {
        let mut cfg = testing::test_config();
        cfg.num_phys_pages = 4;
        let kernel = testing::boot_with(cfg, "vm-teardown");
        let frames_total = kernel.cfg.num_phys_pages as usize;
        let swap_free = kernel.swap.num_free();
        {
            let space = anon_space(&kernel);
            kernel
                .machine
                .mmu
                .set_translation(Some(space.translation.clone()));
            let base = map_anon(&space, 8);
            for i in 0..8u64 {
                poke(&kernel, &space, (base as u64 + i) * 128, 1);
            }
            assert!(kernel.swap.num_free() < swap_free);
            kernel.machine.mmu.set_translation(None);
        }
        // Every frame back on the free list, every swap sector released.
        let mut free = 0;
        for _ in 0..frames_total {
            if kernel.physmem.find_free_page().is_some() {
                free += 1;
            }
        }
        assert_eq!(free, frames_total);
        assert_eq!(kernel.swap.num_free(), swap_free);
    }

    #[test]
    fn virtual_allocation_respects_the_limit() {
        let kernel = testing::boot("vm-alloc");
        let space = anon_space(&kernel);
        let max = kernel.cfg.max_virt_pages as usize;
        assert!(space.alloc(max).is_none());
        assert!(space.alloc(max - 1).is_some());
        assert!(space.alloc(1).is_none());
    }

    #[test]
    fn stack_sits_behind_an_unmapped_guard() {
        let kernel = testing::boot("vm-stack");
        let space = anon_space(&kernel);
        kernel
            .machine
            .mmu
            .set_translation(Some(space.translation.clone()));
        let page_size = kernel.cfg.page_size;
        let stack_pages = kernel.cfg.user_stack_size.div_ceil(page_size);
        let sp = space.stack_allocate().unwrap();
        assert_eq!(sp, ((4 + stack_pages) * page_size - 16) as u64);

        // Stack pages are wired, zeroed and writable.
        assert_eq!(peek(&kernel, &space, sp - 8), 0);
        poke(&kernel, &space, sp - 8, 9);
        assert_eq!(peek(&kernel, &space, sp - 8), 9);

        // The guard region rejects every access.
        let guard_addr = 2 * page_size as u64;
        let err = kernel.machine.mmu.read_mem(guard_addr, 1).unwrap_err();
        assert_eq!(err.exception, ExceptionType::AddressError);
        kernel.physmem.audit();
        kernel.machine.mmu.set_translation(None);
    }

    /// Build a minimal ELF32 RISC-V executable: one loadable image section
    /// holding `payload` at virtual address 0, one zero-fill section after
    /// it.
    fn sample_elf(payload: &[u8], bss_size: u32, ei_data: u8, machine: u16) -> Vec<u8> {
        let shoff = 52u32;
        let data_off = shoff + 3 * 40;
        let mut image = vec![0u8; data_off as usize + payload.len()];
        image[0..4].copy_from_slice(b"\x7fELF");
        image[4] = 1; // ELFCLASS32
        image[5] = ei_data;
        image[6] = 1; // EV_CURRENT
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        image[18..20].copy_from_slice(&machine.to_le_bytes());
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[24..28].copy_from_slice(&0u32.to_le_bytes()); // e_entry
        image[32..36].copy_from_slice(&shoff.to_le_bytes());
        image[46..48].copy_from_slice(&40u16.to_le_bytes());
        image[48..50].copy_from_slice(&3u16.to_le_bytes());
        {
            let mut shdr = |index: usize, sh_type: u32, flags: u32, vaddr: u32, off: u32, size: u32| {
                let base = shoff as usize + index * 40;
                image[base + 4..base + 8].copy_from_slice(&sh_type.to_le_bytes());
                image[base + 8..base + 12].copy_from_slice(&flags.to_le_bytes());
                image[base + 12..base + 16].copy_from_slice(&vaddr.to_le_bytes());
                image[base + 16..base + 20].copy_from_slice(&off.to_le_bytes());
                image[base + 20..base + 24].copy_from_slice(&size.to_le_bytes());
            };
            shdr(0, 0, 0, 0, 0, 0);
            // PROGBITS, ALLOC|WRITE
            shdr(1, 1, 0x3, 0, data_off, payload.len() as u32);
            // NOBITS, ALLOC|WRITE
            shdr(2, 8, 0x3, payload.len() as u32, 0, bss_size);
        }
        image[data_off as usize..].copy_from_slice(payload);
        image
    }

    #[test]
    fn program_pages_fault_in_from_the_executable() {
        let kernel = testing::boot("vm-elf");
        let page_size = kernel.cfg.page_size;
        // Two full pages of image, one page of zero-fill.
        let payload: Vec<u8> = (0..2 * page_size).map(|i| (i % 251) as u8).collect();
        let image = sample_elf(&payload, page_size as u32, 1, 0xf3);

        kernel.filesystem.create("/prog", image.len()).unwrap();
        let file = kernel.filesystem.open("/prog").unwrap();
        file.write_at(&image, 0);
        kernel.filesystem.close("/prog");

        let process = crate::process::Process::new(&kernel, "/prog").unwrap();
        assert_eq!(process.code_start_address(), 0);
        let space = process.addrspace.clone();
        kernel
            .machine
            .mmu
            .set_translation(Some(space.translation.clone()));

        for (i, expected) in payload.iter().enumerate() {
            assert_eq!(peek(&kernel, &space, i as u64), *expected, "byte {i}");
        }
        // The zero-fill section reads as zeroes.
        for i in 0..page_size {
            assert_eq!(peek(&kernel, &space, (2 * page_size + i) as u64), 0);
        }
        kernel.physmem.audit();
        kernel.machine.mmu.set_translation(None);
    }

    #[test]
    fn loader_rejects_foreign_binaries() {
        let kernel = testing::boot("vm-elf-reject");
        let be_image = sample_elf(&[0; 16], 0, 2, 0xf3);
        kernel.filesystem.create("/be", be_image.len()).unwrap();
        let file = kernel.filesystem.open("/be").unwrap();
        file.write_at(&be_image, 0);
        kernel.filesystem.close("/be");
        assert_eq!(
            crate::process::Process::new(&kernel, "/be").unwrap_err(),
            ErrorKind::WrongFileEndianess
        );

        let x86_image = sample_elf(&[0; 16], 0, 1, 0x3e);
        kernel.filesystem.create("/x86", x86_image.len()).unwrap();
        let file = kernel.filesystem.open("/x86").unwrap();
        file.write_at(&x86_image, 0);
        kernel.filesystem.close("/x86");
        assert_eq!(
            crate::process::Process::new(&kernel, "/x86").unwrap_err(),
            ErrorKind::ExecFileFormatError
        );
    }
}
