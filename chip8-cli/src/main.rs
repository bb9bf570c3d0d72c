/*
Copyright 2020 Anish Jewalikar

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::{fs, process, thread::sleep, time::Duration};

use chip8_core::{CoreError, GuestState, Jit};
use clap::{App, Arg};
use log::warn;
use sdl2::event::Event;

mod graphics;

/// Guest instructions retired per 60 Hz frame when running under the
/// interpreter. Matches the teacher CLI's `10 * 60 = 600`Hz pacing.
const CYCLES_PER_FRAME: u32 = 10;

fn main() {
    env_logger::init();

    let matches = App::new("chip8-cli")
        .version("0.2.0")
        .about("A CHIP-8 dynamic binary translator with an SDL2 frontend.")
        .arg(
            Arg::with_name("file")
                .help("The ROM file to execute")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("interpret")
                .help("Run under the reference interpreter instead of the JIT")
                .short("i")
                .long("interpret"),
        )
        .get_matches();

    let path = matches.value_of("file").unwrap();
    let interpret_only = matches.is_present("interpret");

    let rom = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(source) => {
            let err = CoreError::RomRead {
                path: path.into(),
                source,
            };
            eprintln!("{err}");
            process::exit(2);
        }
    };

    let mut state = GuestState::new();
    if let Err(err) = state.load_rom(&rom) {
        eprintln!("{err}");
        process::exit(2);
    }

    let context = sdl2::init().unwrap();
    let mut event_pump = context.event_pump().unwrap();
    let mut renderer = graphics::Renderer::new(&context);
    let mut jit = Jit::new();

    'main: loop {
        for _ in 0..CYCLES_PER_FRAME {
            let result = if interpret_only {
                chip8_core::interp::step(&mut state)
            } else {
                jit.step(&mut state)
            };

            match result {
                Ok(()) => {}
                Err(CoreError::BufferExhausted { blocks_compiled }) => {
                    warn!("executable buffer exhausted after {blocks_compiled} blocks, flushing");
                    jit.flush();
                }
                Err(fatal) => {
                    eprintln!("{fatal}");
                    process::exit(3);
                }
            }
        }

        for event in event_pump.poll_iter() {
            if let Event::Quit { .. } = event {
                break 'main;
            }
        }

        if state.draw {
            renderer.render(state.display());
            state.draw = false;
        }

        sleep(Duration::from_secs_f64(1.0 / 60.0));
    }
}
