//! Basalt kernel binary.
//!
//! Boot path: the loader hands over the memory map and the physical-memory
//! mapping; we translate that into the kernel's native boot-info
//! structure, bring the core up (frame allocator, virtual memory, heap,
//! scheduler, network), enable interrupts, and park in the idle loop
//! driving network maintenance.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

#[cfg(not(test))]
mod boot_glue {
    use basalt_kernel::boot::{BootInfo, MemoryMapEntry, MemoryType, BOOT_MAGIC};
    use basalt_kernel::{gdt, interrupts, net, serial, serial_println};
    use bootloader_api::config::Mapping;
    use bootloader_api::info::MemoryRegionKind;
    use bootloader_api::{entry_point, BootloaderConfig};

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    /// Staging area for the translated memory map.
    static mut MEMORY_MAP: [MemoryMapEntry; 64] =
        [MemoryMapEntry::new(0, 0, MemoryType::Reserved); 64];

    fn kernel_main(boot_info: &'static mut bootloader_api::BootInfo) -> ! {
        serial::init();
        serial_println!("basalt kernel booting");

        gdt::init();
        interrupts::init();

        let phys_offset = boot_info
            .physical_memory_offset
            .into_option()
            .expect("physical memory offset not provided by loader");

        // Translate the loader's memory regions into the native map.
        let mut count = 0;
        unsafe {
            let map = &mut *core::ptr::addr_of_mut!(MEMORY_MAP);
            for region in boot_info.memory_regions.iter() {
                if count >= map.len() {
                    break;
                }
                let kind = match region.kind {
                    MemoryRegionKind::Usable => MemoryType::Free,
                    MemoryRegionKind::Bootloader => MemoryType::BootloaderReclaimable,
                    _ => MemoryType::Reserved,
                };
                map[count] =
                    MemoryMapEntry::new(region.start, region.end - region.start, kind);
                count += 1;
            }
        }

        let kernel_len = boot_info.kernel_len;
        let kernel_start = boot_info.kernel_addr;
        let info = BootInfo {
            magic_number: BOOT_MAGIC,
            version: 1,
            memory_map_address: core::ptr::addr_of!(MEMORY_MAP) as u64,
            memory_map_entry_count: count as u64,
            framebuffer_address: 0,
            framebuffer_width: 0,
            framebuffer_height: 0,
            framebuffer_pitch: 0,
            framebuffer_bpp: 0,
            rsdp_address: boot_info.rsdp_addr.into_option().unwrap_or(0),
            kernel_start,
            kernel_end: kernel_start + kernel_len,
            initrd_start: 0,
            initrd_end: 0,
            physical_memory_offset: phys_offset,
        };

        basalt_kernel::init(&info);

        interrupts::enable();
        serial_println!("basalt kernel up, entering idle loop");

        loop {
            net::poll();
            x86_64::instructions::hlt();
        }
    }
}

#[cfg(test)]
fn main() {}
