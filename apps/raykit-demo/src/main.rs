//! raykit headless demo
//!
//! Builds bottom-level structures for a triangle and a quad, instances them
//! on a grid and refreshes the top-level structure every frame while the
//! instances spin. With `--shader-dir` it also traces rays into a storage
//! buffer each frame.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p raykit-demo -- [OPTIONS]
//! ```
//!
//! See `--help` for options. `RUST_LOG` sets the log level.

mod args;
mod scene;
mod tracer;

use std::time::Instant;

use anyhow::Context;
use ash::vk;
use raykit_accel::RayTracingDevice;
use raykit_gpu::command::{begin_command_buffer, end_command_buffer, submit_command_buffer};
use raykit_gpu::{CommandPool, FrameSync, GpuContextBuilder};
use tracing_subscriber::EnvFilter;

use crate::args::{print_help, DemoArgs};
use crate::scene::DemoScene;
use crate::tracer::Tracer;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = DemoArgs::from_env();
    run(&args)
}

fn run(args: &DemoArgs) -> anyhow::Result<()> {
    let context = GpuContextBuilder::new()
        .app_name("raykit-demo")
        .validation(args.validation)
        .build()
        .context("Failed to create a ray tracing capable Vulkan device")?;
    let rt = RayTracingDevice::from_context(&context);
    let device = context.device();

    // SAFETY: every handle below is created from `context` and destroyed
    // before it, after the device is idle.
    unsafe {
        let pool = CommandPool::new(
            device,
            context.queue_family(),
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        let cmd = pool.allocate_command_buffer(device)?;
        let sync = FrameSync::new(device)?;

        let started = Instant::now();
        let mut scene = DemoScene::load(&context, &rt, cmd, args.instances, args.rebuild)?;
        tracing::info!(
            "Scene ready in {:.2?}: {} meshes, {} instances",
            started.elapsed(),
            scene.wrapper.geometries().len(),
            scene.wrapper.instances().len()
        );

        let tracer = match &args.shader_dir {
            Some(dir) => Some(Tracer::new(
                &context,
                &rt,
                &scene,
                dir,
                args.width,
                args.height,
            )?),
            None => None,
        };

        let loop_started = Instant::now();
        for frame in 0..args.frames {
            sync.wait(device)?;
            sync.reset(device)?;

            if frame > 0 {
                if let Some(tracer) = &tracer {
                    tracing::debug!("Frame {}: {} lit pixels", frame - 1, tracer.lit_pixels()?);
                }
            }

            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            let mode = {
                let mut allocator = context.allocator().lock();
                scene.record_frame(&rt, &mut allocator, cmd, frame)?
            };
            if let Some(tracer) = &tracer {
                tracer.record(&rt, cmd, &scene)?;
            }
            end_command_buffer(device, cmd)?;
            submit_command_buffer(device, context.queue(), cmd, sync.in_flight)?;

            tracing::trace!("Frame {frame}: top level {mode:?}");
        }
        sync.wait(device)?;

        if args.frames > 0 {
            let elapsed = loop_started.elapsed();
            tracing::info!(
                "{} frames in {:.2?} ({:.1} us per frame)",
                args.frames,
                elapsed,
                elapsed.as_secs_f64() * 1e6 / f64::from(args.frames)
            );
            if let Some(tracer) = &tracer {
                tracing::info!("Last frame lit {} pixels", tracer.lit_pixels()?);
            }
        }

        context.wait_idle()?;
        let mut allocator = context.allocator().lock();
        if let Some(tracer) = tracer {
            tracer.destroy(device, &mut allocator)?;
        }
        scene.destroy(&rt, &mut allocator)?;
        drop(allocator);
        sync.destroy(device);
        pool.destroy(device);
    }

    Ok(())
}
